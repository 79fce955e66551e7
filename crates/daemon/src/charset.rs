//! Conversion between the host's local text encoding and the wire encoding.
//!
//! Everything on the wire is UTF-8. Some hosts run interpreters that read and
//! write a legacy multi-byte encoding (GB18030 for `cmd.exe` on Windows); the
//! [`Transcoder`] converts at the session boundary so that encoding never
//! reaches the peer. On hosts whose interpreters already speak UTF-8 the
//! transcoder is a passthrough with the same interface.

use encoding_rs::{CoderResult, Decoder, Encoding, GB18030, UTF_8};
use thiserror::Error;

/// Transcoding failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Input is not valid in the encoding it claims to be in.
    #[error("malformed {0} input")]
    Malformed(&'static str),

    /// The target encoding cannot represent some of the input.
    #[error("input not representable in {0}")]
    Unmappable(&'static str),

    /// The configured label names no known encoding.
    #[error("unknown encoding label: {0}")]
    UnknownLabel(String),

    /// The encoding exists but cannot be used for interpreter I/O.
    #[error("unsupported local encoding: {0}")]
    Unsupported(String),
}

/// Converts between the local encoding and UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transcoder {
    /// `None` when local and wire encodings coincide.
    local: Option<&'static Encoding>,
}

impl Transcoder {
    /// A transcoder that passes bytes through untouched.
    pub fn passthrough() -> Self {
        Self { local: None }
    }

    /// A transcoder for the given local encoding.
    pub fn for_encoding(encoding: &'static Encoding) -> Self {
        if encoding == UTF_8 {
            Self::passthrough()
        } else {
            Self {
                local: Some(encoding),
            }
        }
    }

    /// A transcoder for a WHATWG encoding label such as `gbk` or `shift_jis`.
    pub fn for_label(label: &str) -> Result<Self, EncodingError> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| EncodingError::UnknownLabel(label.to_string()))?;

        // UTF-16 and the replacement encoding cannot be encoded back into.
        if encoding.output_encoding() != encoding {
            return Err(EncodingError::Unsupported(encoding.name().to_string()));
        }

        Ok(Self::for_encoding(encoding))
    }

    /// The transcoder for the interpreters on this platform.
    pub fn for_platform() -> Self {
        if cfg!(windows) {
            Self::for_encoding(GB18030)
        } else {
            Self::passthrough()
        }
    }

    /// Returns the configured transcoder, or the platform default.
    pub fn from_label_or_platform(label: Option<&str>) -> Result<Self, EncodingError> {
        match label {
            Some(label) => Self::for_label(label),
            None => Ok(Self::for_platform()),
        }
    }

    /// Whether both directions are the identity.
    pub fn is_passthrough(&self) -> bool {
        self.local.is_none()
    }

    /// The local encoding.
    pub fn local_encoding(&self) -> &'static Encoding {
        self.local.unwrap_or(UTF_8)
    }

    /// Converts local bytes to wire bytes.
    pub fn to_wire(&self, bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
        let Some(encoding) = self.local else {
            return Ok(bytes.to_vec());
        };

        let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
        if had_errors {
            return Err(EncodingError::Malformed(encoding.name()));
        }
        Ok(text.into_owned().into_bytes())
    }

    /// Converts wire bytes to local bytes.
    pub fn from_wire(&self, bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
        let Some(encoding) = self.local else {
            return Ok(bytes.to_vec());
        };

        let text = std::str::from_utf8(bytes).map_err(|_| EncodingError::Malformed(UTF_8.name()))?;
        let (out, _, had_errors) = encoding.encode(text);
        if had_errors {
            return Err(EncodingError::Unmappable(encoding.name()));
        }
        Ok(out.into_owned())
    }

    /// A stateful local-to-wire decoder for one output stream.
    pub fn wire_decoder(&self) -> WireDecoder {
        WireDecoder {
            decoder: self
                .local
                .map(|encoding| encoding.new_decoder_without_bom_handling()),
        }
    }
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::for_platform()
    }
}

/// Incremental local-to-wire conversion for a byte stream.
///
/// Unlike [`Transcoder::to_wire`], a multi-byte character split across two
/// reads is held back until its remaining bytes arrive. Malformed input is
/// replaced with U+FFFD instead of failing, since output has nowhere to report
/// an error to.
pub struct WireDecoder {
    decoder: Option<Decoder>,
}

impl WireDecoder {
    /// Decodes the next chunk of the stream.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.decode_chunk(chunk, false)
    }

    /// Ends the stream, returning whatever was still held back.
    ///
    /// A trailing incomplete character comes out as U+FFFD.
    pub fn finish(&mut self) -> Vec<u8> {
        self.decode_chunk(&[], true)
    }

    fn decode_chunk(&mut self, chunk: &[u8], last: bool) -> Vec<u8> {
        let Some(decoder) = self.decoder.as_mut() else {
            return chunk.to_vec();
        };

        let capacity = decoder
            .max_utf8_buffer_length(chunk.len())
            .unwrap_or(chunk.len() * 3 + 4);
        let mut out = String::with_capacity(capacity);
        let mut consumed = 0;
        loop {
            let (result, read, _) = decoder.decode_to_string(&chunk[consumed..], &mut out, last);
            consumed += read;
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => out.reserve(chunk.len() - consumed + 16),
            }
        }
        out.into_bytes()
    }
}
