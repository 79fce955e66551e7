//! Output pumps.
//!
//! Each session runs one pump per output stream. A pump forwards everything the
//! interpreter writes to the transport as `outputTerminal` packets until the
//! stream ends or the session is torn down.

use std::fmt;
use std::sync::Arc;

use shellmux_protocol::Packet;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use super::process::{Session, SessionStreams};
use super::registry::SessionRegistry;
use crate::charset::Transcoder;
use crate::transport::Transport;

/// Buffer size for reading interpreter output.
pub const READ_CHUNK_SIZE: usize = 512;

/// Cursor home followed by erase display.
pub const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[2J";

const FORM_FEED: u8 = 0x0c;

/// Which interpreter stream a pump reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Rewrites a lone form feed (what `cls` emits) into an ANSI clear screen.
pub fn normalize_chunk(chunk: &[u8]) -> &[u8] {
    if chunk == [FORM_FEED] {
        CLEAR_SCREEN
    } else {
        chunk
    }
}

/// Starts a pump for one of `session`'s output streams.
///
/// The pump is counted against the session before this returns, so the
/// session's `active_pumps` is accurate as soon as the caller gets control
/// back. Use [`spawn_session_pumps`] when a session has more than one stream.
pub fn spawn_pump<R>(
    reader: R,
    stream: OutputStream,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    transcoder: Transcoder,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    session.pumps_started(1);
    tokio::spawn(run_pump(
        reader, stream, session, registry, transport, transcoder,
    ))
}

/// Starts the stdout and stderr pumps of a freshly spawned session.
///
/// Both are counted before either starts, so exactly one of them reports the
/// close even if the interpreter exits at once.
pub fn spawn_session_pumps(
    streams: SessionStreams,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    transcoder: Transcoder,
) -> [JoinHandle<()>; 2] {
    session.pumps_started(2);
    let stdout = tokio::spawn(run_pump(
        streams.stdout,
        OutputStream::Stdout,
        Arc::clone(&session),
        Arc::clone(&registry),
        Arc::clone(&transport),
        transcoder,
    ));
    let stderr = tokio::spawn(run_pump(
        streams.stderr,
        OutputStream::Stderr,
        session,
        registry,
        transport,
        transcoder,
    ));
    [stdout, stderr]
}

async fn run_pump<R>(
    mut reader: R,
    stream: OutputStream,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    transcoder: Transcoder,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut decoder = transcoder.wire_decoder();
    let mut buffer = [0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = session.cancelled() => {
                tracing::debug!(session_id = %session.id(), %stream, "Pump stopped by teardown");
                break;
            }
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!(session_id = %session.id(), %stream, "Interpreter closed stream");
                send_output(&*transport, &session, decoder.finish());
                close_session(&session, &registry).await;
                break;
            }
            Ok(n) => {
                // A partial multi-byte character produces nothing until the rest arrives.
                let output = decoder.decode(normalize_chunk(&buffer[..n]));
                send_output(&*transport, &session, output);
                session.touch();
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    %stream,
                    error = %e,
                    "Error reading interpreter output"
                );
                send_output(&*transport, &session, decoder.finish());
                close_session(&session, &registry).await;
                break;
            }
        }
    }

    // Dropping the reader closes our end of the pipe.
    drop(reader);

    if session.pump_finished() {
        transport.send(Packet::session_closed(session.correlation(), None));
        session.mark_drained();
    }
}

fn send_output(transport: &dyn Transport, session: &Session, output: Vec<u8>) {
    if !output.is_empty() {
        transport.send(Packet::output(session.correlation(), &output));
    }
}

async fn close_session(session: &Arc<Session>, registry: &SessionRegistry) {
    registry.remove_if_same(session.id(), session);
    session.terminate().await;
}
