//! Message definitions
//!
//! Typed view of one wire frame: opcode plus opaque payload. Payload
//! schemas belong to the command catalog; the core only interprets the
//! error response.

use bytes::Bytes;

use super::registry;

/// Opcodes understood by the built-in command catalog
pub mod codes {
    pub const ERROR_RESP: u8 = 0x00;
    pub const PING_REQ: u8 = 0x01;
    pub const PING_RESP: u8 = 0x02;
    pub const GET_REQ: u8 = 0x03;
    pub const GET_RESP: u8 = 0x04;
    pub const PUT_REQ: u8 = 0x05;
    pub const PUT_RESP: u8 = 0x06;
    pub const DEL_REQ: u8 = 0x07;
    pub const DEL_RESP: u8 = 0x08;
    pub const LIST_KEYS_REQ: u8 = 0x09;
    pub const LIST_KEYS_RESP: u8 = 0x0A;
}

/// One decoded frame: opcode plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Operation code
    pub code: u8,

    /// Opaque payload, interpreted by the command adapter
    pub payload: Bytes,
}

impl Message {
    /// Create a message with a payload
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Create a message with an empty payload
    pub fn empty(code: u8) -> Self {
        Self {
            code,
            payload: Bytes::new(),
        }
    }

    /// Message name from the opcode registry, if registered
    pub fn name(&self) -> Option<&'static str> {
        registry::opcode_name(self.code)
    }

    /// Whether this frame is the server error response
    pub fn is_error(&self) -> bool {
        self.code == codes::ERROR_RESP
    }
}

/// A decoded server error response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Server-assigned error code
    pub code: u32,

    /// Human-readable error text
    pub message: String,
}

impl ErrorMessage {
    /// Create an error message
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

impl From<ErrorMessage> for crate::error::NimbusError {
    fn from(err: ErrorMessage) -> Self {
        crate::error::NimbusError::Server {
            code: err.code,
            message: err.message,
        }
    }
}
