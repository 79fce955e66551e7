//! Interpreter process management.
//!
//! A [`Session`] owns one command-interpreter process started with piped
//! standard streams. Its output streams are handed to the I/O pumps at spawn
//! time; stdin stays with the session and is written by the controller.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use shellmux_protocol::{CorrelationToken, SessionId};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::charset::EncodingError;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The interpreter or one of its streams could not be opened.
    #[error("failed to spawn interpreter: {0}")]
    SpawnFailed(String),

    /// The session has already been torn down.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Writing to the interpreter's stdin failed.
    #[error("failed to write to interpreter: {0}")]
    WriteFailed(String),

    /// Delivering a signal to the interpreter failed.
    #[error("failed to signal interpreter: {0}")]
    SignalFailed(String),

    /// Input could not be converted to the local encoding.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// The interpreter to start for each session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Program path or name looked up in `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl ShellCommand {
    /// A command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Sets the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// The output streams of a freshly spawned session, one per pump.
pub struct SessionStreams {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// One running interpreter and its liveness state.
pub struct Session {
    id: SessionId,
    correlation: CorrelationToken,
    pid: Option<u32>,

    /// Taken on teardown.
    child: Mutex<Option<Child>>,

    /// Held across each write so one request's bytes are never interleaved
    /// with another's.
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,

    /// Cancelled on teardown; the pumps drop their stream ends when it fires.
    shutdown: CancellationToken,
    closed: AtomicBool,

    /// Cancelled by the last pump after it has reported the close.
    drained: CancellationToken,

    /// Last activity as nanoseconds since `epoch`.
    epoch: Instant,
    last_activity: AtomicU64,

    active_pumps: AtomicUsize,
}

impl Session {
    /// Spawns the interpreter with piped stdin, stdout and stderr.
    ///
    /// If any stream cannot be taken the process is killed before the error is
    /// returned.
    pub fn spawn(
        id: &str,
        correlation: &str,
        shell: &ShellCommand,
    ) -> Result<(Self, SessionStreams), SessionError> {
        let mut std_cmd = std::process::Command::new(&shell.program);
        std_cmd
            .args(&shell.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so an interrupt reaches the foreground command
        // and teardown reaches everything the interpreter started.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell.program, e)))?;

        let pid = child.id();

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.start_kill();
                    return Err(SessionError::SpawnFailed(format!(
                        "{}: standard streams unavailable",
                        shell.program
                    )));
                }
            };

        tracing::debug!(
            session_id = %id,
            pid = ?pid,
            program = %shell.program,
            "Spawned interpreter"
        );

        let session = Session {
            id: id.to_string(),
            correlation: correlation.to_string(),
            pid,
            child: Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            drained: CancellationToken::new(),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            active_pumps: AtomicUsize::new(0),
        };

        Ok((session, SessionStreams { stdout, stderr }))
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the correlation token used on outbound packets.
    pub fn correlation(&self) -> &CorrelationToken {
        &self.correlation
    }

    /// Returns the interpreter's process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session is torn down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Records activity now.
    ///
    /// The timestamp strictly advances on every call, even when the clock has
    /// not ticked since the previous one.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let _ = self
            .last_activity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(now.max(current + 1))
            });
    }

    /// Returns the time of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_activity.load(Ordering::SeqCst))
    }

    /// How long the session had been idle at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Writes bytes to the interpreter's stdin.
    pub async fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SessionError::AlreadyTerminated(self.id.clone()))?;

        stdin
            .write_all(data)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Delivers an interrupt to the interpreter's process group.
    #[cfg(unix)]
    pub fn interrupt(&self) -> Result<(), SessionError> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if self.is_closed() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        let pid = self
            .pid
            .ok_or_else(|| SessionError::SignalFailed("process has no pid".to_string()))?;

        killpg(Pid::from_raw(pid as i32), Signal::SIGINT)
            .map_err(|e| SessionError::SignalFailed(e.to_string()))
    }

    /// Delivers an interrupt to the interpreter.
    ///
    /// Console control events are not wired up on this platform.
    #[cfg(not(unix))]
    pub fn interrupt(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        Err(SessionError::SignalFailed(
            "interrupt not supported on this platform".to_string(),
        ))
    }

    /// Tears the session down: stops the pumps, kills the process, closes stdin.
    ///
    /// Only the first call does anything; it returns `true`.
    pub async fn terminate(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.shutdown.cancel();
        self.kill_process();

        // A write blocked on a full pipe fails once the process is gone.
        self.stdin.lock().await.take();

        tracing::info!(session_id = %self.id, pid = ?self.pid, "Session terminated");
        true
    }

    fn kill_process(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut child) = child else {
            return;
        };

        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }

        if let Err(e) = child.start_kill() {
            tracing::debug!(session_id = %self.id, error = %e, "Interpreter already exited");
        }

        // Reap in the background; the kill is only a request.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }

    /// Registers `count` pumps as consuming this session's streams.
    ///
    /// All pumps of a session must be registered before any of them runs, or
    /// the first to finish would see itself as the last.
    pub(crate) fn pumps_started(&self, count: usize) {
        self.active_pumps.fetch_add(count, Ordering::SeqCst);
    }

    /// Unregisters a pump; returns `true` for the last one.
    pub(crate) fn pump_finished(&self) -> bool {
        self.active_pumps.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Marks the close as reported to the peer.
    pub(crate) fn mark_drained(&self) {
        self.drained.cancel();
    }

    /// Resolves once the last pump has stopped and reported the close.
    pub fn drained(&self) -> WaitForCancellationFuture<'_> {
        self.drained.cancelled()
    }

    /// Number of pumps currently consuming this session's output.
    pub fn active_pumps(&self) -> usize {
        self.active_pumps.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("correlation", &self.correlation)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}
