//! Frame codecs for stream and message transports.
//!
//! Stream transports (TCP) carry one JSON document per `\n`-terminated line.
//! Message transports (WebSocket) carry exactly one document per message.

use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

/// Framing strategy for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Newline-delimited JSON over a byte stream.
    Lines,
    /// One JSON document per transport message.
    Messages,
}

impl Framing {
    /// Serializes a value into the bytes written to the transport.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        let mut bytes = serde_json::to_vec(value)?;
        if *self == Framing::Lines {
            bytes.push(b'\n');
        }
        Ok(Bytes::from(bytes))
    }

    /// Creates a decoder for inbound data.
    pub fn decoder(&self, max_frame_size: usize) -> FrameDecoder {
        match self {
            Framing::Lines => FrameDecoder::Lines(LineDecoder::new(max_frame_size)),
            Framing::Messages => FrameDecoder::Messages(MessageDecoder::new(max_frame_size)),
        }
    }
}

fn parse_document(raw: &[u8]) -> Result<Value, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

/// Line-delimited JSON decoder.
///
/// The trailing incomplete line stays buffered between calls to `feed`.
pub struct LineDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl LineDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Appends data and returns the complete documents it produced.
    ///
    /// Fails with `FrameTooLarge` (and drops the buffered data) when the
    /// incomplete trailing line grows past the maximum frame size.
    pub fn feed(&mut self, data: &[u8]) -> Result<LineFrames<'_>, ProtocolError> {
        self.buffer.extend_from_slice(data);

        let trailing = match self.buffer.iter().rposition(|&b| b == b'\n') {
            Some(pos) => self.buffer.len() - pos - 1,
            None => self.buffer.len(),
        };
        if trailing > self.max_frame_size {
            self.buffer.clear();
            return Err(ProtocolError::FrameTooLarge {
                size: trailing,
                max: self.max_frame_size,
            });
        }

        Ok(LineFrames { decoder: self })
    }

    /// Extracts the next complete line, skipping blank ones.
    fn next_frame(&mut self) -> Option<Result<Value, ProtocolError>> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == b'\n')?;
            let segment = self.buffer.split_to(pos + 1);

            let mut line = &segment[..pos];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_size {
                return Some(Err(ProtocolError::FrameTooLarge {
                    size: line.len(),
                    max: self.max_frame_size,
                }));
            }

            return Some(parse_document(line));
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Documents decoded by one `LineDecoder::feed` call.
///
/// Dropping the iterator early leaves the remaining lines buffered for the
/// next call.
pub struct LineFrames<'a> {
    decoder: &'a mut LineDecoder,
}

impl Iterator for LineFrames<'_> {
    type Item = Result<Value, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

/// Decoder for message transports: one message, one document.
pub struct MessageDecoder {
    max_frame_size: usize,
}

impl MessageDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Frames<'_>, ProtocolError> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }
        Ok(Frames::Message(Some(parse_document(data))))
    }
}

/// Decoder for either framing strategy.
pub enum FrameDecoder {
    Lines(LineDecoder),
    Messages(MessageDecoder),
}

impl FrameDecoder {
    /// Feeds inbound transport data and returns the decoded documents.
    ///
    /// An `Err` from `feed` itself is fatal for the connection; an `Err`
    /// item from the iterator only affects that one document.
    pub fn feed(&mut self, data: &[u8]) -> Result<Frames<'_>, ProtocolError> {
        match self {
            FrameDecoder::Lines(decoder) => decoder.feed(data).map(Frames::Lines),
            FrameDecoder::Messages(decoder) => decoder.feed(data),
        }
    }
}

/// Iterator over documents produced by a single `feed` call.
pub enum Frames<'a> {
    Lines(LineFrames<'a>),
    Message(Option<Result<Value, ProtocolError>>),
}

impl Iterator for Frames<'_> {
    type Item = Result<Value, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Frames::Lines(lines) => lines.next(),
            Frames::Message(doc) => doc.take(),
        }
    }
}
