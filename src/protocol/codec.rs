// src/protocol/codec.rs
//! Newline-delimited JSON framing
//!
//! Wraps `LinesCodec` so that a malformed line yields an item-level
//! `ProtocolError` instead of a stream-level error: a `FramedRead` stops
//! after its first decoder error, and one bad message must not take the
//! channel down.

use crate::protocol::message::{Message, ProtocolError};
use bytes::BytesMut;
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

/// Codec for [`Message`] frames
#[derive(Debug, Clone)]
pub struct MessageCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl MessageCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn frame(&self, line: &str) -> Option<Result<Message, ProtocolError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(parse_message(line))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(8 * 1024 * 1024)
    }
}

/// Parse and validate one envelope
pub fn parse_message(line: &str) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("type"))?;

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("id"))?;

    let data = match object.get("data") {
        None | Some(Value::Null) => None,
        Some(data) => Some(data.clone()),
    };

    Ok(Message::new(id, kind, data))
}

impl Decoder for MessageCodec {
    type Item = Result<Message, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => match self.frame(&line) {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                },
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Err(ProtocolError::Oversized(self.max_line_bytes))))
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) => match self.frame(&line) {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                },
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Err(ProtocolError::Oversized(self.max_line_bytes))))
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }
}

/// Serialize one envelope, refusing lines the peer's decoder would drop
pub fn encode_line(message: &Message, max_line_bytes: usize) -> Result<String, ProtocolError> {
    let line =
        serde_json::to_string(message).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if line.len() > max_line_bytes {
        return Err(ProtocolError::Oversized(max_line_bytes));
    }
    Ok(line)
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode_line(&item, self.max_line_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.lines.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => {
                io::Error::new(io::ErrorKind::InvalidData, "message exceeds max line length")
            }
        })
    }
}

/// Direction of a logged message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

/// Log a message at debug level, or at trace level for health-probe traffic
pub fn log_message(direction: Direction, message: &Message, quiet: bool) {
    if quiet {
        trace!(dir = direction.as_str(), id = %message.id, kind = %message.kind, "message");
    } else {
        debug!(dir = direction.as_str(), id = %message.id, kind = %message.kind, "message");
    }
}
