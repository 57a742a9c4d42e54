//! Built-in key/value commands
//!
//! Commands for the standard store operations. Payload layouts (the frame
//! header around them is described in [`crate::protocol`]):
//!
//! ```text
//! GET_REQ:        [key bytes]
//! GET_RESP:       [found: u8][value bytes]          (value only when found=1)
//! PUT_REQ:        [key_len: u32 BE][key][value bytes]
//! PUT_RESP:       (empty)
//! DEL_REQ:        [key bytes]
//! DEL_RESP:       (empty)
//! LIST_KEYS_REQ:  (empty)
//! LIST_KEYS_RESP: [done: u8]([key_len: u32 BE][key])*
//! ```
//!
//! `LIST_KEYS_RESP` streams: the server may answer with any number of
//! frames, setting `done=1` on the last one. All other responses are a
//! single frame.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{NimbusError, Result};
use crate::protocol::{codes, ErrorMessage, Message};

use super::{RetryBudget, StoreCommand};

// =============================================================================
// Fetch
// =============================================================================

/// Read the value stored under a key
pub struct FetchCommand {
    key: Bytes,
    budget: RetryBudget,
    done_tx: Sender<Result<Option<Bytes>>>,
}

impl FetchCommand {
    /// Create a fetch together with the receiver its outcome arrives on
    ///
    /// The outcome is `Ok(None)` when the key does not exist.
    pub fn new(key: impl Into<Bytes>) -> (Arc<Self>, Receiver<Result<Option<Bytes>>>) {
        let (done_tx, done_rx) = bounded(1);
        let cmd = Arc::new(Self {
            key: key.into(),
            budget: RetryBudget::new(),
            done_tx,
        });
        (cmd, done_rx)
    }
}

impl StoreCommand for FetchCommand {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn build_request(&self) -> Message {
        Message::new(codes::GET_REQ, self.key.clone())
    }

    fn expected_code(&self) -> u8 {
        codes::GET_RESP
    }

    fn on_success(&self, response: Message) -> bool {
        let mut payload = response.payload;
        if payload.is_empty() {
            let _ = self.done_tx.send(Err(NimbusError::Decode(
                "fetch response missing found flag".to_string(),
            )));
            return true;
        }

        let found = payload.get_u8();
        let outcome = if found == 0 {
            Ok(None)
        } else {
            Ok(Some(payload))
        };
        let _ = self.done_tx.send(outcome);
        true
    }

    fn on_server_error(&self, err: ErrorMessage) {
        let _ = self.done_tx.send(Err(err.into()));
    }

    fn on_error(&self, err: NimbusError) {
        let _ = self.done_tx.send(Err(err));
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }
}

// =============================================================================
// Put
// =============================================================================

/// Store a value under a key
pub struct PutCommand {
    key: Bytes,
    value: Bytes,
    budget: RetryBudget,
    done_tx: Sender<Result<()>>,
}

impl PutCommand {
    /// Create a put together with the receiver its outcome arrives on
    pub fn new(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> (Arc<Self>, Receiver<Result<()>>) {
        let (done_tx, done_rx) = bounded(1);
        let cmd = Arc::new(Self {
            key: key.into(),
            value: value.into(),
            budget: RetryBudget::new(),
            done_tx,
        });
        (cmd, done_rx)
    }
}

impl StoreCommand for PutCommand {
    fn name(&self) -> &'static str {
        "put"
    }

    fn build_request(&self) -> Message {
        let mut payload = BytesMut::with_capacity(4 + self.key.len() + self.value.len());
        payload.put_u32(self.key.len() as u32);
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(&self.value);
        Message::new(codes::PUT_REQ, payload.freeze())
    }

    fn expected_code(&self) -> u8 {
        codes::PUT_RESP
    }

    fn on_success(&self, _response: Message) -> bool {
        let _ = self.done_tx.send(Ok(()));
        true
    }

    fn on_server_error(&self, err: ErrorMessage) {
        let _ = self.done_tx.send(Err(err.into()));
    }

    fn on_error(&self, err: NimbusError) {
        let _ = self.done_tx.send(Err(err));
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }
}

// =============================================================================
// Delete
// =============================================================================

/// Remove a key and its value
pub struct DeleteCommand {
    key: Bytes,
    budget: RetryBudget,
    done_tx: Sender<Result<()>>,
}

impl DeleteCommand {
    /// Create a delete together with the receiver its outcome arrives on
    pub fn new(key: impl Into<Bytes>) -> (Arc<Self>, Receiver<Result<()>>) {
        let (done_tx, done_rx) = bounded(1);
        let cmd = Arc::new(Self {
            key: key.into(),
            budget: RetryBudget::new(),
            done_tx,
        });
        (cmd, done_rx)
    }
}

impl StoreCommand for DeleteCommand {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn build_request(&self) -> Message {
        Message::new(codes::DEL_REQ, self.key.clone())
    }

    fn expected_code(&self) -> u8 {
        codes::DEL_RESP
    }

    fn on_success(&self, _response: Message) -> bool {
        let _ = self.done_tx.send(Ok(()));
        true
    }

    fn on_server_error(&self, err: ErrorMessage) {
        let _ = self.done_tx.send(Err(err.into()));
    }

    fn on_error(&self, err: NimbusError) {
        let _ = self.done_tx.send(Err(err));
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }
}

// =============================================================================
// List Keys
// =============================================================================

/// Enumerate every key on a server
///
/// The response arrives as a stream of frames; keys accumulate until a
/// frame with the done flag set completes the command. A retry restarts
/// the stream from scratch on the next node.
pub struct ListKeysCommand {
    budget: RetryBudget,
    keys: Mutex<Vec<Bytes>>,
    done_tx: Sender<Result<Vec<Bytes>>>,
}

impl ListKeysCommand {
    /// Create a list-keys together with the receiver its outcome arrives on
    pub fn new() -> (Arc<Self>, Receiver<Result<Vec<Bytes>>>) {
        let (done_tx, done_rx) = bounded(1);
        let cmd = Arc::new(Self {
            budget: RetryBudget::new(),
            keys: Mutex::new(Vec::new()),
            done_tx,
        });
        (cmd, done_rx)
    }

    fn fail_decode(&self, reason: &str) -> bool {
        let _ = self
            .done_tx
            .send(Err(NimbusError::Decode(reason.to_string())));
        true
    }
}

impl StoreCommand for ListKeysCommand {
    fn name(&self) -> &'static str {
        "list-keys"
    }

    fn build_request(&self) -> Message {
        // A re-dispatch restarts the stream, so drop any partial batch.
        self.keys.lock().clear();
        Message::empty(codes::LIST_KEYS_REQ)
    }

    fn expected_code(&self) -> u8 {
        codes::LIST_KEYS_RESP
    }

    fn on_success(&self, response: Message) -> bool {
        let mut payload = response.payload;
        if payload.is_empty() {
            return self.fail_decode("list-keys response missing done flag");
        }

        let done = payload.get_u8() == 1;
        let mut keys = self.keys.lock();
        while payload.has_remaining() {
            if payload.remaining() < 4 {
                return self.fail_decode("list-keys entry truncated before length");
            }
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return self.fail_decode("list-keys entry shorter than its length");
            }
            keys.push(payload.copy_to_bytes(len));
        }

        if done {
            let _ = self.done_tx.send(Ok(std::mem::take(&mut *keys)));
        }
        done
    }

    fn on_server_error(&self, err: ErrorMessage) {
        let _ = self.done_tx.send(Err(err.into()));
    }

    fn on_error(&self, err: NimbusError) {
        let _ = self.done_tx.send(Err(err));
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_decodes_found_value() {
        let (cmd, rx) = FetchCommand::new("user:1");
        let mut payload = BytesMut::new();
        payload.put_u8(1);
        payload.extend_from_slice(b"alice");

        let done = cmd.on_success(Message::new(codes::GET_RESP, payload.freeze()));

        assert!(done);
        let value = rx.recv().unwrap().unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"alice")));
    }

    #[test]
    fn fetch_decodes_missing_key() {
        let (cmd, rx) = FetchCommand::new("user:404");
        let done = cmd.on_success(Message::new(codes::GET_RESP, vec![0u8]));

        assert!(done);
        assert_eq!(rx.recv().unwrap().unwrap(), None);
    }

    #[test]
    fn put_request_frames_key_and_value() {
        let (cmd, _rx) = PutCommand::new("k", "vvv");
        let req = cmd.build_request();

        assert_eq!(req.code, codes::PUT_REQ);
        let mut payload = req.payload;
        assert_eq!(payload.get_u32(), 1);
        assert_eq!(payload.copy_to_bytes(1), Bytes::from_static(b"k"));
        assert_eq!(payload, Bytes::from_static(b"vvv"));
    }

    #[test]
    fn list_keys_accumulates_across_frames() {
        let (cmd, rx) = ListKeysCommand::new();

        let mut first = BytesMut::new();
        first.put_u8(0);
        first.put_u32(1);
        first.extend_from_slice(b"a");
        first.put_u32(2);
        first.extend_from_slice(b"bb");
        assert!(!cmd.on_success(Message::new(codes::LIST_KEYS_RESP, first.freeze())));

        let mut last = BytesMut::new();
        last.put_u8(1);
        last.put_u32(3);
        last.extend_from_slice(b"ccc");
        assert!(cmd.on_success(Message::new(codes::LIST_KEYS_RESP, last.freeze())));

        let keys = rx.recv().unwrap().unwrap();
        assert_eq!(
            keys,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"bb"),
                Bytes::from_static(b"ccc"),
            ]
        );
    }

    #[test]
    fn list_keys_rebuild_drops_partial_batch() {
        let (cmd, rx) = ListKeysCommand::new();

        let mut partial = BytesMut::new();
        partial.put_u8(0);
        partial.put_u32(5);
        partial.extend_from_slice(b"stale");
        assert!(!cmd.on_success(Message::new(codes::LIST_KEYS_RESP, partial.freeze())));

        // Re-dispatch after a node failure renders the request again.
        let _ = cmd.build_request();

        let mut last = BytesMut::new();
        last.put_u8(1);
        last.put_u32(5);
        last.extend_from_slice(b"fresh");
        assert!(cmd.on_success(Message::new(codes::LIST_KEYS_RESP, last.freeze())));

        assert_eq!(rx.recv().unwrap().unwrap(), vec![Bytes::from_static(b"fresh")]);
    }

    #[test]
    fn list_keys_truncated_entry_fails_decode() {
        let (cmd, rx) = ListKeysCommand::new();

        let mut bad = BytesMut::new();
        bad.put_u8(1);
        bad.put_u32(10);
        bad.extend_from_slice(b"short");
        assert!(cmd.on_success(Message::new(codes::LIST_KEYS_RESP, bad.freeze())));

        assert!(matches!(rx.recv().unwrap(), Err(NimbusError::Decode(_))));
    }
}
