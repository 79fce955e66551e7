//! # shellmux Protocol Library
//!
//! Packet definitions shared by the shellmux daemon and its peers.
//!
//! ## Overview
//!
//! - **Packets**: one [`Packet`] shape for every action, with a correlation
//!   token (`event`) echoed back on replies
//! - **Requests**: [`Request::from_packet`] validates inbound packets into typed
//!   requests and reports missing or malformed fields as [`RequestError`]
//! - **Codecs**: JSON and MessagePack packet serialization, hex payloads
//!
//! ## Example Usage
//!
//! ```rust
//! use shellmux_protocol::{act, field, Packet, Request};
//!
//! let packet = Packet::new(act::INPUT_TERMINAL, "evt-1")
//!     .with_data(field::TERMINAL, "abc")
//!     .with_data(field::INPUT, "6c730a");
//!
//! match Request::from_packet(&packet).unwrap() {
//!     Request::SendInput(req) => assert_eq!(req.payload, b"ls\n"),
//!     _ => unreachable!(),
//! }
//! ```

pub mod error;
pub mod messages;

pub use error::{ErrorCode, ProtocolError, RequestError, Result};
pub use messages::{
    act, decode_payload, encode_payload, field, CorrelationToken, KillSession, Packet,
    PingSession, Request, ResizeSession, SendInput, SessionId, StartSession,
    SESSION_CLOSED_MESSAGE,
};
