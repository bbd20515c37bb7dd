//! # ctlwire-protocol
//!
//! Wire protocol for ctlwire, a command/response client for remote
//! controllers.
//!
//! This crate provides:
//! - Command and Response envelope types
//! - Classification of inbound documents into correlated responses and
//!   unsolicited messages
//! - Two framing strategies: newline-delimited JSON for byte streams and
//!   one-document-per-message for message transports
//! - Protocol error types

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{FrameDecoder, Frames, Framing, LineDecoder, LineFrames, MessageDecoder};
pub use error::ProtocolError;
pub use message::{
    now_timestamp, AuthResult, Command, CommandType, DisplayData, DisplayList, Inbound, Response,
    ResponseStatus, WindowData, WindowList,
};

/// Default port of the remote controller.
pub const DEFAULT_PORT: u16 = 8080;

/// Default maximum size of a single inbound frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
