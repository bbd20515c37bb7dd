//! Client error types.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ctlwire_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("command {id} timed out after {timeout:?}")]
    CommandTimeout { id: String, timeout: Duration },

    #[error("command {id} failed: {message}")]
    CommandFailed { id: String, message: String },

    #[error("reconnection exhausted after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    #[error("command id already in flight: {0}")]
    DuplicateCommandId(String),

    #[error("client destroyed")]
    Destroyed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Transport(_)
                | ClientError::ConnectTimeout(_)
                | ClientError::CommandTimeout { .. }
                | ClientError::ConnectionLost
                | ClientError::NotConnected
        )
    }

    /// Returns whether this error came from the transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Transport(_) | ClientError::ConnectTimeout(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
