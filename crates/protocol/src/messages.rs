//! Packet definitions for shellmux.
//!
//! Every message crossing the connection is a [`Packet`]: an action name, an
//! optional human-readable message, a loosely typed data map and the `event`
//! correlation token that ties a reply to the request (and UI surface) that
//! caused it. Binary payloads inside `data` are always hex strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, RequestError, Result};

/// Opaque identifier chosen by the peer for a terminal session.
pub type SessionId = String;

/// Opaque token identifying the request/channel an outbound packet answers.
pub type CorrelationToken = String;

/// Action names used on the wire.
pub mod act {
    /// Start a terminal session.
    pub const INIT_TERMINAL: &str = "initTerminal";
    /// Keystrokes for a terminal session.
    pub const INPUT_TERMINAL: &str = "inputTerminal";
    /// Terminal geometry change (accepted, ignored).
    pub const RESIZE_TERMINAL: &str = "resizeTerminal";
    /// Tear a terminal session down.
    pub const KILL_TERMINAL: &str = "killTerminal";
    /// Keep-alive for a terminal session.
    pub const PING_TERMINAL: &str = "pingTerminal";

    /// A chunk of terminal output.
    pub const OUTPUT_TERMINAL: &str = "outputTerminal";
    /// The terminal session ended or does not exist.
    pub const QUIT_TERMINAL: &str = "quitTerminal";
    /// A request failed.
    pub const ERROR: &str = "error";
}

/// Data field names.
pub mod field {
    pub const TERMINAL: &str = "terminal";
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
    pub const COLS: &str = "cols";
    pub const ROWS: &str = "rows";
    pub const CODE: &str = "code";
}

/// Message sent with `quitTerminal` when the session is gone.
pub const SESSION_CLOSED_MESSAGE: &str = "terminal session closed";

/// A single message on the connection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Packet {
    /// Action name, see [`act`].
    pub act: String,
    /// Optional human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Action-specific fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    /// Correlation token echoed back on every reply.
    #[serde(default)]
    pub event: CorrelationToken,
}

impl Packet {
    /// Creates a packet with no data.
    pub fn new(act: impl Into<String>, event: impl Into<CorrelationToken>) -> Self {
        Self {
            act: act.into(),
            msg: None,
            data: Map::new(),
            event: event.into(),
        }
    }

    /// Adds a data field.
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Sets the human-readable message.
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    /// Returns a string data field, or `None` if absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Returns an unsigned integer data field that fits in `u16`.
    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.data
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// A chunk of terminal output, hex encoded.
    pub fn output(event: &str, bytes: &[u8]) -> Self {
        Self::new(act::OUTPUT_TERMINAL, event).with_data(field::OUTPUT, encode_payload(bytes))
    }

    /// Session-ended notification.
    pub fn session_closed(event: &str, msg: Option<&str>) -> Self {
        let packet = Self::new(act::QUIT_TERMINAL, event);
        match msg {
            Some(msg) => packet.with_msg(msg),
            None => packet,
        }
    }

    /// Error reply for a failed request.
    pub fn error(event: &str, code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::new(act::ERROR, event)
            .with_msg(msg)
            .with_data(field::CODE, code.as_str())
    }

    /// Serializes the packet as a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a packet from JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the packet to MessagePack, with named fields.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes a packet from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Hex-encodes a binary payload for the wire.
pub fn encode_payload(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decodes a hex payload taken from `field`.
pub fn decode_payload(
    field: &'static str,
    text: &str,
) -> std::result::Result<Vec<u8>, RequestError> {
    hex::decode(text).map_err(|e| RequestError::DataInvalid {
        field,
        reason: e.to_string(),
    })
}

// ============================================================================
// Typed requests
// ============================================================================

/// Request to start a terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSession {
    pub session_id: SessionId,
}

/// Input for a terminal session, already hex-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendInput {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

/// Terminal geometry change. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeSession {
    pub session_id: Option<SessionId>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Request to tear a session down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSession {
    pub session_id: SessionId,
}

/// Keep-alive for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingSession {
    pub session_id: SessionId,
}

/// An inbound request, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartSession(StartSession),
    SendInput(SendInput),
    ResizeSession(ResizeSession),
    KillSession(KillSession),
    PingSession(PingSession),
}

fn session_id(packet: &Packet) -> std::result::Result<SessionId, RequestError> {
    packet
        .get_str(field::TERMINAL)
        .map(str::to_string)
        .ok_or(RequestError::IdentifierNotFound)
}

impl Request {
    /// Validates an inbound packet into a typed request.
    ///
    /// For input the payload field is checked and decoded before the session
    /// identifier, so a missing or malformed payload is reported even when the
    /// identifier is also absent.
    pub fn from_packet(packet: &Packet) -> std::result::Result<Self, RequestError> {
        match packet.act.as_str() {
            act::INIT_TERMINAL => Ok(Request::StartSession(StartSession {
                session_id: session_id(packet)?,
            })),
            act::INPUT_TERMINAL => {
                let input = packet
                    .get_str(field::INPUT)
                    .ok_or(RequestError::DataNotFound(field::INPUT))?;
                let payload = decode_payload(field::INPUT, input)?;
                Ok(Request::SendInput(SendInput {
                    session_id: session_id(packet)?,
                    payload,
                }))
            }
            act::RESIZE_TERMINAL => Ok(Request::ResizeSession(ResizeSession {
                session_id: packet.get_str(field::TERMINAL).map(str::to_string),
                cols: packet.get_u16(field::COLS),
                rows: packet.get_u16(field::ROWS),
            })),
            act::KILL_TERMINAL => Ok(Request::KillSession(KillSession {
                session_id: session_id(packet)?,
            })),
            act::PING_TERMINAL => Ok(Request::PingSession(PingSession {
                session_id: session_id(packet)?,
            })),
            other => Err(RequestError::UnknownAction(other.to_string())),
        }
    }
}
