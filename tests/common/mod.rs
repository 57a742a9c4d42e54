//! Shared test support
//!
//! In-process servers speaking the wire protocol, so tests exercise real
//! sockets without an external store. Each server binds an ephemeral port
//! and serves every connection on its own thread.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use nimbuskv::protocol::{codes, encode_error, read_message, write_message, ErrorMessage, Message};
use nimbuskv::NodeConfig;

/// Backing map shared between servers, so a multi-node cluster behaves
/// like one replicated store.
pub type SharedStore = Arc<Mutex<HashMap<Bytes, Bytes>>>;

pub fn kv_store() -> SharedStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Handle to a running in-process server
pub struct MockServer {
    addr: String,
    requests: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Request frames received across all connections
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Sockets accepted since the server started
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Spawn a server that answers each request frame with the handler's frames
pub fn spawn_with<H>(handler: H) -> MockServer
where
    H: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    {
        let requests = Arc::clone(&requests);
        let connections = Arc::clone(&connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                connections.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&requests);
                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    while let Ok(request) = read_message(&mut stream) {
                        requests.fetch_add(1, Ordering::SeqCst);
                        for response in handler(&request) {
                            if write_message(&mut stream, &response).is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
    }

    MockServer {
        addr,
        requests,
        connections,
    }
}

/// Spawn a server whose handler owns each accepted socket outright
pub fn spawn_raw<H>(handler: H) -> MockServer
where
    H: Fn(TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    {
        let connections = Arc::clone(&connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                connections.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                thread::spawn(move || handler(stream));
            }
        });
    }

    MockServer {
        addr,
        requests,
        connections,
    }
}

// =============================================================================
// Canned Servers
// =============================================================================

fn kv_handle(store: &SharedStore, request: &Message) -> Vec<Message> {
    let mut store = store.lock();
    match request.code {
        codes::PING_REQ => vec![Message::empty(codes::PING_RESP)],
        codes::GET_REQ => {
            let mut payload = BytesMut::new();
            match store.get(&request.payload) {
                Some(value) => {
                    payload.put_u8(1);
                    payload.extend_from_slice(value);
                }
                None => payload.put_u8(0),
            }
            vec![Message::new(codes::GET_RESP, payload.freeze())]
        }
        codes::PUT_REQ => {
            let mut buf = request.payload.clone();
            let key_len = buf.get_u32() as usize;
            let key = buf.copy_to_bytes(key_len);
            store.insert(key, buf);
            vec![Message::empty(codes::PUT_RESP)]
        }
        codes::DEL_REQ => {
            store.remove(&request.payload);
            vec![Message::empty(codes::DEL_RESP)]
        }
        codes::LIST_KEYS_REQ => {
            // Streamed: every key but the last under done=0, then the
            // last key under the done=1 frame.
            let keys: Vec<Bytes> = store.keys().cloned().collect();
            let mut frames = Vec::new();
            if keys.len() > 1 {
                let mut head = BytesMut::new();
                head.put_u8(0);
                for key in &keys[..keys.len() - 1] {
                    head.put_u32(key.len() as u32);
                    head.extend_from_slice(key);
                }
                frames.push(Message::new(codes::LIST_KEYS_RESP, head.freeze()));
            }
            let mut tail = BytesMut::new();
            tail.put_u8(1);
            if let Some(key) = keys.last() {
                tail.put_u32(key.len() as u32);
                tail.extend_from_slice(key);
            }
            frames.push(Message::new(codes::LIST_KEYS_RESP, tail.freeze()));
            frames
        }
        _ => vec![server_error(400, "unsupported operation")],
    }
}

/// A well-behaved server with its own empty store
pub fn kv_server() -> MockServer {
    kv_server_with_store(kv_store())
}

/// A well-behaved server over a shared store
pub fn kv_server_with_store(store: SharedStore) -> MockServer {
    spawn_with(move |request| kv_handle(&store, request))
}

/// Answers every request with the same error frame
pub fn error_server(code: u32, message: &'static str) -> MockServer {
    spawn_with(move |_| vec![server_error(code, message)])
}

/// Drops the first `drops` accepted sockets on the floor, then serves
/// like a kv server
pub fn recovering_server(drops: usize) -> MockServer {
    let store = kv_store();
    let accepted = AtomicUsize::new(0);
    spawn_raw(move |mut stream| {
        if accepted.fetch_add(1, Ordering::SeqCst) < drops {
            return;
        }
        while let Ok(request) = read_message(&mut stream) {
            for response in kv_handle(&store, &request) {
                if write_message(&mut stream, &response).is_err() {
                    return;
                }
            }
        }
    })
}

/// Reads requests and never answers
pub fn silent_server() -> MockServer {
    spawn_with(|_| Vec::new())
}

/// Answers every request with a frame the command will not expect
pub fn mismatch_server() -> MockServer {
    spawn_with(|_| vec![Message::new(codes::GET_RESP, vec![0u8])])
}

/// Reads one request, then drops the socket without answering
pub fn closing_server() -> MockServer {
    spawn_raw(|mut stream| {
        let _ = read_message(&mut stream);
    })
}

/// Answers the first request with bytes that cannot be a frame
pub fn garbage_server() -> MockServer {
    spawn_raw(|mut stream| {
        if read_message(&mut stream).is_ok() {
            // A zero-length frame is invalid at the decoder.
            let _ = stream.write_all(&[0x00, 0x00, 0x00, 0x00]);
            let _ = stream.flush();
            // Hold the socket open so the client sees garbage, not EOF.
            thread::sleep(Duration::from_millis(200));
        }
    })
}

pub fn server_error(code: u32, message: &str) -> Message {
    encode_error(&ErrorMessage::new(code, message))
}

// =============================================================================
// Helpers
// =============================================================================

/// An address that refuses connections: bound once to reserve a port,
/// then released before anything listens on it.
pub fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Node settings tuned for fast tests: quick sweeps, quick probes, and an
/// idle timeout long enough to stay out of the way unless a test lowers it.
pub fn node_config(addr: &str) -> NodeConfig {
    NodeConfig::builder()
        .addr(addr)
        .min_connections(1)
        .max_connections(16)
        .idle_timeout_ms(60_000)
        .connect_timeout_ms(1_000)
        .expiry_interval_ms(25)
        .failure_threshold(3)
        .health_check_interval_ms(25)
        .build()
}

/// Poll `cond` until it holds or the timeout passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
