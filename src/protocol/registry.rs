//! Opcode registry
//!
//! The opcode↔name mapping is defined by the server protocol and treated
//! as a fixed external table, materialized once at process start.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::codes;

/// The built-in opcode table: (code, message name)
///
/// Extended builds of the store ship additional entries; anything the
/// client may receive must appear here or decoding rejects it.
pub const OPCODE_TABLE: &[(u8, &str)] = &[
    (codes::ERROR_RESP, "ErrorResp"),
    (codes::PING_REQ, "PingReq"),
    (codes::PING_RESP, "PingResp"),
    (codes::GET_REQ, "GetReq"),
    (codes::GET_RESP, "GetResp"),
    (codes::PUT_REQ, "PutReq"),
    (codes::PUT_RESP, "PutResp"),
    (codes::DEL_REQ, "DelReq"),
    (codes::DEL_RESP, "DelResp"),
    (codes::LIST_KEYS_REQ, "ListKeysReq"),
    (codes::LIST_KEYS_RESP, "ListKeysResp"),
];

fn table() -> &'static HashMap<u8, &'static str> {
    static TABLE: OnceLock<HashMap<u8, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| OPCODE_TABLE.iter().copied().collect())
}

/// Look up the message name for an opcode
pub fn opcode_name(code: u8) -> Option<&'static str> {
    table().get(&code).copied()
}

/// Whether an opcode is part of the protocol table
pub fn is_registered(code: u8) -> bool {
    table().contains_key(&code)
}
