//! Protocol Module
//!
//! Defines the wire framing for client-server communication.
//!
//! ## Frame Format
//! ```text
//! ┌──────────────┬────────────┬─────────────────────────┐
//! │ Length (4)   │ Opcode (1) │        Payload          │
//! └──────────────┴────────────┴─────────────────────────┘
//! ```
//! `Length` is big-endian and counts the opcode byte plus the payload
//! (`1 + payload.len()`), never the length prefix itself.
//!
//! ## Opcode Space
//! The opcode↔name table is supplied by the server protocol and loaded
//! once at process start (see [`registry`]). The core interprets exactly
//! one payload schema itself, the error response:
//! ```text
//! ┌──────────────┬─────────────────────────┐
//! │ ErrCode (4)  │   UTF-8 message          │
//! └──────────────┴─────────────────────────┘
//! ```
//! Every other payload passes through opaque for the command adapters.

pub mod registry;

mod codec;
mod message;

pub use codec::{
    decode_error, encode_error, encode_message, read_message, write_message, FrameDecoder,
    HEADER_SIZE, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE,
};
pub use message::{codes, ErrorMessage, Message};
