//! Error types for the protocol crate.

use thiserror::Error;

/// Errors raised while turning an inbound packet into a typed request.
///
/// These are caller errors: the dispatch layer reports them back to the peer
/// and the daemon keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// A required data field is absent or has the wrong type.
    #[error("required field missing: {0}")]
    DataNotFound(&'static str),

    /// A data field is present but its payload cannot be decoded.
    #[error("invalid data in field {field}: {reason}")]
    DataInvalid {
        /// The offending field.
        field: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// The session identifier field is absent.
    ///
    /// Distinct from the session not being registered, which is not an error.
    #[error("session identifier missing")]
    IdentifierNotFound,

    /// The packet names an action this daemon does not handle.
    #[error("unknown action: {0}")]
    UnknownAction(String),
}

/// Stable error codes carried in error packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    DataNotFound,
    DataInvalid,
    IdentifierNotFound,
    UnknownAction,
    SpawnFailed,
    EncodingFailed,
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DataNotFound => "data_not_found",
            ErrorCode::DataInvalid => "data_invalid",
            ErrorCode::IdentifierNotFound => "identifier_not_found",
            ErrorCode::UnknownAction => "unknown_action",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::EncodingFailed => "encoding_failed",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl RequestError {
    /// The error code reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::DataNotFound(_) => ErrorCode::DataNotFound,
            RequestError::DataInvalid { .. } => ErrorCode::DataInvalid,
            RequestError::IdentifierNotFound => ErrorCode::IdentifierNotFound,
            RequestError::UnknownAction(_) => ErrorCode::UnknownAction,
        }
    }
}

/// Packet (de)serialization errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a packet.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a packet.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for packet codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
