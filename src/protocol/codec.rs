//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//! ```text
//! ┌──────────────┬────────────┬─────────────────────────────┐
//! │ Length (4)   │ Opcode (1) │          Payload            │
//! └──────────────┴────────────┴─────────────────────────────┘
//! ```
//! Length is big-endian and covers the opcode byte plus the payload.
//!
//! Frames arrive from a streaming byte source, so decoding is split in
//! two: [`FrameDecoder`] reassembles frames from arbitrary read chunks,
//! and the blocking [`read_message`]/[`write_message`] helpers serve the
//! synchronous probe and test paths.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{NimbusError, Result};

use super::message::{codes, ErrorMessage, Message};
use super::registry;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Full header size: 4-byte length prefix + 1-byte opcode
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Message Encoding
// =============================================================================

/// Encode a message into one wire frame
///
/// Format: length (4, big-endian, counts opcode + payload) + opcode (1) + payload
pub fn encode_message(message: &Message) -> bytes::Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.payload.len());
    buf.put_u32((1 + message.payload.len()) as u32);
    buf.put_u8(message.code);
    buf.extend_from_slice(&message.payload);
    buf.freeze()
}

/// Validate a frame length taken from the wire
fn validate_length(length: usize) -> Result<()> {
    if length == 0 {
        return Err(NimbusError::Decode(
            "Zero-length frame: missing opcode".to_string(),
        ));
    }
    if length - 1 > MAX_PAYLOAD_SIZE as usize {
        return Err(NimbusError::Decode(format!(
            "Payload too large: {} bytes (max {})",
            length - 1,
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

/// Validate an opcode against the registry
fn validate_opcode(code: u8) -> Result<()> {
    if !registry::is_registered(code) {
        return Err(NimbusError::Decode(format!(
            "Unknown opcode: 0x{:02x}",
            code
        )));
    }
    Ok(())
}

// =============================================================================
// Streaming Frame Reassembly
// =============================================================================

/// Reassembles complete frames from a streaming byte source
///
/// Bytes are appended with [`push`](Self::push) as they arrive off the
/// socket; [`next_message`](Self::next_message) pops complete frames in
/// order, leaving any partial trailing bytes buffered for the next read.
/// A single read may carry several frames, a frame may be split across
/// reads (including inside the length prefix), and both cases compose.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append bytes read from the transport
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete message, if one is buffered
    ///
    /// Returns `Ok(None)` when more bytes are needed. Fails when the
    /// length prefix or opcode violates the protocol; the buffer past the
    /// offending frame is not trustworthy after that.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        validate_length(length)?;

        if self.buf.len() < LENGTH_PREFIX_SIZE + length {
            // Frame not fully buffered yet
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        let code = self.buf[0];
        self.buf.advance(1);
        let payload = self.buf.split_to(length - 1).freeze();

        validate_opcode(code)?;

        Ok(Some(Message { code, payload }))
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// =============================================================================
// Error Response Encoding/Decoding
// =============================================================================

/// Encode a server error into its wire message
///
/// Payload format: error code (4, big-endian) + UTF-8 message
pub fn encode_error(error: &ErrorMessage) -> Message {
    let mut payload = BytesMut::with_capacity(4 + error.message.len());
    payload.put_u32(error.code);
    payload.extend_from_slice(error.message.as_bytes());
    Message::new(codes::ERROR_RESP, payload.freeze())
}

/// Decode the server error response payload
pub fn decode_error(message: &Message) -> Result<ErrorMessage> {
    if message.code != codes::ERROR_RESP {
        return Err(NimbusError::Decode(format!(
            "Not an error response: opcode 0x{:02x}",
            message.code
        )));
    }
    if message.payload.len() < 4 {
        return Err(NimbusError::Decode(format!(
            "Error response payload too short: {} bytes",
            message.payload.len()
        )));
    }

    let code = u32::from_be_bytes([
        message.payload[0],
        message.payload[1],
        message.payload[2],
        message.payload[3],
    ]);
    let text = String::from_utf8_lossy(&message.payload[4..]).into_owned();

    Ok(ErrorMessage::new(code, text))
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read one complete message from a blocking stream
///
/// Blocks until a full frame is received or an error occurs. Used by the
/// health-check probe path; pooled connections reassemble via
/// [`FrameDecoder`] instead.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix)?;

    let length = u32::from_be_bytes(prefix) as usize;
    validate_length(length)?;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    let code = body[0];
    validate_opcode(code)?;

    Ok(Message::new(code, body.split_off(1)))
}

/// Write one message to a blocking stream
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&encode_message(message))?;
    writer.flush()?;
    Ok(())
}
