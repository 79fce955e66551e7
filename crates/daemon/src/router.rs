//! Message router for dispatching inbound packets to the session controller.
//!
//! The router validates each packet into a typed [`Request`], calls the
//! matching controller operation, and turns any failure into an `error` packet
//! carrying the request's correlation token.

use std::sync::Arc;

use shellmux_protocol::{ErrorCode, Packet, Request, RequestError};
use tracing::{debug, warn};

use crate::session::{SessionController, SessionError};

/// Result type for router operations.
pub type RouterResult = Result<(), RouterError>;

/// Errors that can occur during packet routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The packet did not form a valid request.
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    /// The controller rejected the request.
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl RouterError {
    /// The error code reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::Request(e) => e.code(),
            RouterError::Session(e) => match e {
                SessionError::SpawnFailed(_) => ErrorCode::SpawnFailed,
                SessionError::Encoding(_) => ErrorCode::EncodingFailed,
                SessionError::AlreadyTerminated(_)
                | SessionError::WriteFailed(_)
                | SessionError::SignalFailed(_) => ErrorCode::InternalError,
            },
        }
    }

    /// Converts the error into an `error` packet.
    pub fn to_error_packet(&self, event: &str) -> Packet {
        Packet::error(event, self.code(), self.to_string())
    }
}

/// Dispatches inbound packets.
pub struct MessageRouter {
    controller: Arc<SessionController>,
}

impl MessageRouter {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }

    /// The controller requests are dispatched to.
    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Routes a packet to its handler.
    ///
    /// Successful requests have no direct reply. Session output and
    /// session-closed notifications travel through the transport.
    pub async fn route(&self, packet: &Packet) -> RouterResult {
        debug!(act = %packet.act, event = %packet.event, "Routing packet");

        let event = packet.event.as_str();
        match Request::from_packet(packet)? {
            Request::StartSession(req) => {
                self.controller.start_session(event, &req.session_id).await?;
            }
            Request::SendInput(req) => {
                self.controller.send_input(event, &req).await?;
            }
            Request::ResizeSession(req) => {
                self.controller.resize_session(&req);
            }
            Request::KillSession(req) => {
                self.controller.kill_session(event, &req).await;
            }
            Request::PingSession(req) => {
                self.controller.ping_session(&req);
            }
        }

        Ok(())
    }

    /// Routes a packet, returning an `error` reply if it failed.
    pub async fn handle(&self, packet: Packet) -> Option<Packet> {
        match self.route(&packet).await {
            Ok(()) => None,
            Err(e) => {
                warn!(act = %packet.act, event = %packet.event, error = %e, "Request failed");
                Some(e.to_error_packet(&packet.event))
            }
        }
    }
}
