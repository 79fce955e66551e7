//! Session controller.
//!
//! The entry points the request router calls into. The controller owns no
//! session state of its own: everything lives in the shared
//! [`SessionRegistry`].

use std::sync::Arc;
use std::time::Duration;

use shellmux_protocol::{
    KillSession, Packet, PingSession, ResizeSession, SendInput, SESSION_CLOSED_MESSAGE,
};

use super::process::{Session, SessionError, ShellCommand};
use super::pump::spawn_session_pumps;
use super::registry::SessionRegistry;
use crate::charset::Transcoder;
use crate::transport::Transport;

/// Input byte that is delivered as an interrupt instead of being written.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// How long shutdown waits for torn-down sessions to report their close.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts, feeds, pings and kills sessions.
pub struct SessionController {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    transcoder: Transcoder,
    shell: ShellCommand,
}

impl SessionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        transcoder: Transcoder,
        shell: ShellCommand,
    ) -> Self {
        Self {
            registry,
            transport,
            transcoder,
            shell,
        }
    }

    /// The registry sessions are kept in.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The interpreter new sessions run.
    pub fn shell(&self) -> &ShellCommand {
        &self.shell
    }

    /// Spawns an interpreter, registers it under `session_id` and starts its
    /// pumps.
    ///
    /// A session already registered under the same ID is torn down.
    pub async fn start_session(
        &self,
        correlation: &str,
        session_id: &str,
    ) -> Result<Arc<Session>, SessionError> {
        let (session, streams) = Session::spawn(session_id, correlation, &self.shell)?;
        let session = Arc::new(session);

        if let Some(replaced) = self.registry.set(session_id, Arc::clone(&session)) {
            tracing::warn!(session_id = %session_id, "Replacing existing session");
            replaced.terminate().await;
        }

        spawn_session_pumps(
            streams,
            Arc::clone(&session),
            Arc::clone(&self.registry),
            Arc::clone(&self.transport),
            self.transcoder,
        );

        session.touch();
        tracing::info!(session_id = %session_id, pid = ?session.pid(), "Session started");
        Ok(session)
    }

    /// Delivers input to a session.
    ///
    /// An absent session is reported to the peer as closed, not as an error.
    pub async fn send_input(
        &self,
        correlation: &str,
        request: &SendInput,
    ) -> Result<(), SessionError> {
        let Some(session) = self.registry.get(&request.session_id) else {
            self.transport
                .send(Packet::session_closed(correlation, Some(SESSION_CLOSED_MESSAGE)));
            return Ok(());
        };

        if request.payload == [INTERRUPT_BYTE] {
            if let Err(e) = session.interrupt() {
                tracing::warn!(
                    session_id = %request.session_id,
                    error = %e,
                    "Failed to interrupt interpreter"
                );
            }
            session.touch();
            return Ok(());
        }

        let local = self.transcoder.from_wire(&request.payload)?;

        if let Err(e) = session.write_input(&local).await {
            tracing::warn!(
                session_id = %request.session_id,
                error = %e,
                "Input write failed, closing session"
            );
            self.registry.remove_if_same(&request.session_id, &session);
            session.terminate().await;
            return Ok(());
        }

        session.touch();
        Ok(())
    }

    /// Terminal geometry does not apply to piped interpreters.
    pub fn resize_session(&self, request: &ResizeSession) {
        tracing::debug!(
            session_id = ?request.session_id,
            cols = ?request.cols,
            rows = ?request.rows,
            "Ignoring resize"
        );
    }

    /// Unregisters and tears down a session.
    pub async fn kill_session(&self, correlation: &str, request: &KillSession) {
        match self.registry.remove_one(&request.session_id) {
            Some(session) => {
                tracing::info!(session_id = %request.session_id, "Killing session");
                session.terminate().await;
            }
            None => {
                self.transport
                    .send(Packet::session_closed(correlation, Some(SESSION_CLOSED_MESSAGE)));
            }
        }
    }

    /// Refreshes a session's activity time.
    pub fn ping_session(&self, request: &PingSession) {
        if let Some(session) = self.registry.get(&request.session_id) {
            session.touch();
        }
    }

    /// Tears down every session.
    ///
    /// Returns once each session's close has been handed to the transport, or
    /// after [`SHUTDOWN_DRAIN_TIMEOUT`].
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), "Terminating all sessions");
        for session in &sessions {
            session.terminate().await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        for session in &sessions {
            if tokio::time::timeout_at(deadline, session.drained()).await.is_err() {
                tracing::warn!(session_id = %session.id(), "Session pumps did not stop in time");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use shellmux_protocol::{act, decode_payload, field};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn controller() -> (SessionController, UnboundedReceiver<Packet>) {
        let (transport, rx) = ChannelTransport::new();
        let controller = SessionController::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(transport),
            Transcoder::passthrough(),
            ShellCommand::new("/bin/sh"),
        );
        (controller, rx)
    }

    fn input(id: &str, payload: &[u8]) -> SendInput {
        SendInput {
            session_id: id.to_string(),
            payload: payload.to_vec(),
        }
    }

    async fn next_packet(rx: &mut UnboundedReceiver<Packet>) -> Packet {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("transport closed")
    }

    /// Collects output until `needle` shows up.
    async fn wait_for_output(rx: &mut UnboundedReceiver<Packet>, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let packet = next_packet(rx).await;
            if packet.act == act::OUTPUT_TERMINAL {
                let hex = packet.get_str(field::OUTPUT).unwrap();
                let bytes = decode_payload(field::OUTPUT, hex).unwrap();
                seen.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_start_session_registers_and_pumps() {
        let (controller, _rx) = controller();

        let session = controller.start_session("evt", "abc").await.unwrap();

        assert_eq!(controller.registry().len(), 1);
        assert_eq!(session.active_pumps(), 2);
        assert_eq!(session.correlation(), "evt");

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_session_spawn_failure() {
        let (transport, _rx) = ChannelTransport::new();
        let controller = SessionController::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(transport),
            Transcoder::passthrough(),
            ShellCommand::new("/nonexistent/shell"),
        );

        let result = controller.start_session("evt", "abc").await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_session_replaces_existing() {
        let (controller, _rx) = controller();

        let first = controller.start_session("evt", "abc").await.unwrap();
        let second = controller.start_session("evt", "abc").await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(controller.registry().len(), 1);
        assert!(Arc::ptr_eq(&controller.registry().get("abc").unwrap(), &second));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_input_round_trip() {
        let (controller, mut rx) = controller();
        controller.start_session("evt-io", "abc").await.unwrap();

        controller
            .send_input("evt-io", &input("abc", b"echo controller_ok\n"))
            .await
            .unwrap();

        let output = wait_for_output(&mut rx, "controller_ok").await;
        assert!(output.contains("controller_ok"));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_input_advances_activity() {
        let (controller, _rx) = controller();
        let session = controller.start_session("evt", "abc").await.unwrap();

        let before = session.last_activity();
        controller.send_input("evt", &input("abc", b":\n")).await.unwrap();
        assert!(session.last_activity() > before);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_input_to_absent_session() {
        let (controller, mut rx) = controller();

        controller.send_input("evt-x", &input("ghost", b"ls\n")).await.unwrap();

        let packet = next_packet(&mut rx).await;
        assert_eq!(packet.act, act::QUIT_TERMINAL);
        assert_eq!(packet.event, "evt-x");
        assert_eq!(packet.msg.as_deref(), Some(SESSION_CLOSED_MESSAGE));
    }

    #[tokio::test]
    async fn test_write_failure_closes_session() {
        let (transport, mut rx) = ChannelTransport::new();
        let controller = SessionController::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(transport),
            Transcoder::passthrough(),
            // Keeps its output open but stops reading input.
            ShellCommand::new("/bin/sh").with_args(["-c", "exec 0<&-; sleep 5"]),
        );
        let session = controller.start_session("evt", "abc").await.unwrap();

        for _ in 0..100 {
            if controller.registry().is_empty() {
                break;
            }
            controller.send_input("evt", &input("abc", b"ls\n")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(session.is_closed());
        assert!(controller.registry().is_empty());

        let packet = next_packet(&mut rx).await;
        assert_eq!(packet.act, act::QUIT_TERMINAL);
        assert!(packet.msg.is_none());
        timeout(Duration::from_secs(5), session.drained())
            .await
            .expect("pumps did not stop");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_close_reports() {
        let (controller, mut rx) = controller();
        controller.start_session("evt-a", "a").await.unwrap();
        controller.start_session("evt-b", "b").await.unwrap();

        controller.shutdown().await;

        let mut events = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            assert_eq!(packet.act, act::QUIT_TERMINAL);
            events.push(packet.event);
        }
        events.sort();
        assert_eq!(events, vec!["evt-a".to_string(), "evt-b".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupt_is_signalled_not_written() {
        let (controller, mut rx) = controller();
        let session = controller.start_session("evt", "abc").await.unwrap();

        controller.send_input("evt", &input("abc", &[0x03])).await.unwrap();

        // Non-interactive sh dies on SIGINT; nothing was echoed back first.
        let packet = next_packet(&mut rx).await;
        assert_eq!(packet.act, act::QUIT_TERMINAL);
        assert!(session.is_closed());
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_kill_session_is_idempotent() {
        let (controller, mut rx) = controller();
        let session = controller.start_session("evt", "abc").await.unwrap();
        let kill = KillSession {
            session_id: "abc".to_string(),
        };

        controller.kill_session("evt", &kill).await;
        assert!(session.is_closed());
        assert!(controller.registry().is_empty());

        // The pumps report the first kill.
        let packet = next_packet(&mut rx).await;
        assert_eq!(packet.act, act::QUIT_TERMINAL);
        assert!(packet.msg.is_none());

        controller.kill_session("evt", &kill).await;
        let packet = next_packet(&mut rx).await;
        assert_eq!(packet.act, act::QUIT_TERMINAL);
        assert_eq!(packet.msg.as_deref(), Some(SESSION_CLOSED_MESSAGE));
    }

    #[tokio::test]
    async fn test_ping_session() {
        let (controller, mut rx) = controller();
        let session = controller.start_session("evt", "abc").await.unwrap();

        let before = session.last_activity();
        controller.ping_session(&PingSession {
            session_id: "abc".to_string(),
        });
        assert!(session.last_activity() > before);

        // Pinging an unknown session is silent.
        controller.ping_session(&PingSession {
            session_id: "ghost".to_string(),
        });
        assert!(rx.try_recv().is_err());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_is_noop() {
        let (controller, mut rx) = controller();
        controller.resize_session(&ResizeSession {
            session_id: Some("abc".to_string()),
            cols: Some(80),
            rows: Some(24),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let (controller, _rx) = controller();
        let a = controller.start_session("evt", "a").await.unwrap();
        let b = controller.start_session("evt", "b").await.unwrap();

        controller.shutdown().await;

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(controller.registry().is_empty());
    }
}
