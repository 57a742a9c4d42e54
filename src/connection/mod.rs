//! Client connection handling
//!
//! One [`Connection`] wraps one TCP socket to one server. A connection
//! carries at most one command at a time; the node checks connections out
//! of its pool, so a healthy connection is either idle in the pool or
//! reserved by exactly one in-flight command.
//!
//! ## Responsibilities
//!
//! - Establish the socket (optional connect timeout, `TCP_NODELAY`)
//! - Write request frames for the in-flight command
//! - Run a reader thread that reassembles frames from arbitrary TCP chunks
//! - Track idle time for the pool's expiry sweep
//!
//! Responses are not interpreted here. Every decoded frame is handed to the
//! owning node, which classifies it against the in-flight command.

use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::command::StoreCommand;
use crate::config::NodeConfig;
use crate::error::{NimbusError, Result};
use crate::node::Node;
use crate::protocol::{encode_message, FrameDecoder};

/// Read buffer size for the reader thread
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Hook invoked on every freshly established socket
///
/// Runs after `TCP_NODELAY` is set and before the reader thread starts.
/// The attach point for handshakes such as authentication.
pub type ConnectHook = dyn Fn(&TcpStream) -> Result<()> + Send + Sync;

/// A single pooled socket to one server
pub struct Connection {
    id: u64,
    stream: TcpStream,
    /// Command currently holding this connection, if any
    in_flight: Mutex<Option<Arc<dyn StoreCommand>>>,
    last_used: Mutex<Instant>,
    closed: AtomicBool,
    node: Weak<Node>,
}

impl Connection {
    /// Connect to the node's server and start the reader thread
    pub fn establish(
        id: u64,
        config: &NodeConfig,
        node: Weak<Node>,
        hook: Option<&ConnectHook>,
    ) -> Result<Arc<Self>> {
        let addr = config.socket_addr()?;
        let stream = match config.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true)?;

        if let Some(hook) = hook {
            hook(&stream)?;
        }

        let conn = Arc::new(Self {
            id,
            stream,
            in_flight: Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            node,
        });

        // Register with the owning node before the reader exists, so the
        // reader's exit accounting can never run against an unregistered
        // connection.
        if let Some(node) = conn.node.upgrade() {
            node.register_connection(&conn);
        }

        debug!("Connection {} established to {}", id, addr);

        let reader = Arc::clone(&conn);
        thread::spawn(move || reader_loop(reader));

        Ok(conn)
    }

    /// Connection identifier, unique within its node
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reserve this connection for a command and write its request
    ///
    /// Fails with [`NimbusError::AlreadyInFlight`] when another command
    /// holds the connection. A write failure leaves the connection
    /// unreserved; the caller decides whether the request may have
    /// reached the wire.
    pub fn execute(&self, command: Arc<dyn StoreCommand>) -> Result<()> {
        if self.is_closed() {
            return Err(NimbusError::Connection(format!(
                "connection {} is closed",
                self.id
            )));
        }

        {
            let mut slot = self.in_flight.lock();
            if slot.is_some() {
                return Err(NimbusError::AlreadyInFlight);
            }
            *slot = Some(Arc::clone(&command));
        }
        self.touch();

        let frame = encode_message(&command.build_request());
        trace!(
            "Connection {} sending {} ({} bytes)",
            self.id,
            command.name(),
            frame.len()
        );

        let mut stream = &self.stream;
        if let Err(e) = stream.write_all(&frame).and_then(|_| stream.flush()) {
            self.in_flight.lock().take();
            return Err(e.into());
        }
        Ok(())
    }

    /// Command currently holding this connection
    pub fn current_command(&self) -> Option<Arc<dyn StoreCommand>> {
        self.in_flight.lock().clone()
    }

    /// Release the in-flight reservation, returning the command it held
    pub fn clear_in_flight(&self) -> Option<Arc<dyn StoreCommand>> {
        self.in_flight.lock().take()
    }

    /// Whether a command currently holds this connection
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Mark the connection as used now
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Time since the connection last carried traffic
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the socket
    ///
    /// Idempotent. Unblocks the reader thread, which performs the
    /// node-side accounting exactly once on its way out.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("Connection {} closed", self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("in_flight", &self.is_in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reader thread body: reassemble frames and hand them to the node
///
/// Exits when the socket closes, either deliberately via [`Connection::close`]
/// or because the peer went away. The exit path notifies the node exactly
/// once so pool accounting and in-flight failure handling happen there.
fn reader_loop(conn: Arc<Connection>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut stream = &conn.stream;

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                if !conn.is_closed() {
                    warn!("Connection {} read failed: {}", conn.id, e);
                }
                break;
            }
        };

        decoder.push(&buf[..n]);
        loop {
            match decoder.next_message() {
                Ok(Some(message)) => {
                    let Some(node) = conn.node.upgrade() else {
                        conn.close();
                        return;
                    };
                    node.handle_response(&conn, message);
                }
                Ok(None) => break,
                Err(e) => {
                    // Garbage on the wire poisons the whole stream; there is
                    // no way to resynchronize on frame boundaries.
                    warn!("Connection {} received undecodable frame: {}", conn.id, e);
                    conn.close();
                    if let Some(node) = conn.node.upgrade() {
                        node.handle_connection_closed(&conn, false);
                    }
                    return;
                }
            }
        }
    }

    let deliberate = conn.is_closed();
    conn.close();
    if let Some(node) = conn.node.upgrade() {
        node.handle_connection_closed(&conn, deliberate);
    }
}
