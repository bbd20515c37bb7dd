//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors raised while framing or interpreting envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in frame")]
    InvalidUtf8,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

impl ProtocolError {
    /// Returns whether the error leaves the decoder unable to continue.
    ///
    /// A malformed segment only loses that segment; an oversized one means the
    /// peer is misbehaving and the connection has to go.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}
