//! Node management
//!
//! A [`Node`] owns everything about one server: its connection pool, its
//! lifecycle state, and the failure accounting that decides when the server
//! needs health verification.
//!
//! ```text
//!                 start                stop
//!      Created ----------> Running ----------> ShuttingDown --> Shutdown
//!                            ^  |                   ^
//!              probe passed  |  |  server           | stop
//!                            |  v  unhealthy        |
//!                         HealthChecking -----------+
//! ```
//!
//! ## Responsibilities
//!
//! - Maintain between `min_connections` and `max_connections` live sockets
//! - Dispatch commands onto idle connections, opening new ones on demand
//! - Classify every response frame against the command in flight
//! - Probe the server after consecutive connect failures or a dropped connection
//! - Expire idle connections past `idle_timeout_ms`, keeping the warm floor
//!
//! A node attached to a cluster hands failed commands back for re-selection;
//! a standalone node delivers the failure to the command directly.

mod pool;

use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{RetryCause, RetryTicket};
use crate::command::{PingCommand, StoreCommand};
use crate::config::NodeConfig;
use crate::connection::{ConnectHook, Connection};
use crate::error::{NimbusError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{codes, decode_error, read_message, write_message, Message};

use pool::ConnectionPool;

// =============================================================================
// Node State
// =============================================================================

/// Lifecycle state of a [`Node`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Built but not yet started
    Created,
    /// Accepting and executing commands
    Running,
    /// Probing the server after connect failures or an unexpected close
    HealthChecking,
    /// Stop requested; draining connections
    ShuttingDown,
    /// Terminal state, all connections closed
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Created => "Created",
            NodeState::Running => "Running",
            NodeState::HealthChecking => "HealthChecking",
            NodeState::ShuttingDown => "ShuttingDown",
            NodeState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Builds the probe command a node runs while health checking
///
/// Defaults to [`PingCommand`]; replace it to probe with a domain command,
/// for example fetching a canary key.
pub type ProbeFactory = Arc<dyn Fn() -> Arc<dyn StoreCommand> + Send + Sync>;

// =============================================================================
// Node
// =============================================================================

/// Connection pool and lifecycle manager for one server
pub struct Node {
    config: NodeConfig,
    state: Mutex<NodeState>,
    state_cv: Condvar,
    pool: ConnectionPool,
    /// Commands this node currently owns, pooled or failing over
    executing: AtomicUsize,
    consecutive_failures: AtomicU32,
    next_conn_id: AtomicU64,
    retry_tx: Mutex<Option<Sender<RetryTicket>>>,
    connect_hook: Mutex<Option<Arc<ConnectHook>>>,
    probe_factory: Mutex<Option<ProbeFactory>>,
    events: Arc<EventBus>,
    shutdown_rx: Receiver<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl Node {
    /// Create a standalone node with its own event bus
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        Self::with_events(config, Arc::new(EventBus::new()))
    }

    /// Create a node publishing onto a shared event bus
    pub(crate) fn with_events(config: NodeConfig, events: Arc<EventBus>) -> Result<Arc<Self>> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Ok(Arc::new(Self {
            pool: ConnectionPool::new(config.max_connections),
            config,
            state: Mutex::new(NodeState::Created),
            state_cv: Condvar::new(),
            executing: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            next_conn_id: AtomicU64::new(1),
            retry_tx: Mutex::new(None),
            connect_hook: Mutex::new(None),
            probe_factory: Mutex::new(None),
            events,
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        }))
    }

    /// Address of the server this node manages
    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Event bus this node publishes on
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Number of commands currently owned by this node
    pub fn execute_count(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    /// Established connections, idle or checked out
    pub fn live_connections(&self) -> usize {
        self.pool.live_count()
    }

    /// Connections parked in the idle queue
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    /// Install a hook run on every freshly established socket
    pub fn set_connect_hook(&self, hook: Arc<ConnectHook>) {
        *self.connect_hook.lock() = Some(hook);
    }

    /// Replace the default ping probe used while health checking
    pub fn set_probe_factory(&self, factory: ProbeFactory) {
        *self.probe_factory.lock() = Some(factory);
    }

    pub(crate) fn set_retry_channel(&self, tx: Sender<RetryTicket>) {
        *self.retry_tx.lock() = Some(tx);
    }

    pub(crate) fn clear_retry_channel(&self) {
        self.retry_tx.lock().take();
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the node: warm the pool and begin the idle sweep
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.transition_from("start", &[NodeState::Created], NodeState::Running)?;
        info!(
            "Node {} starting ({} warm connections, max {})",
            self.config.addr, self.config.min_connections, self.config.max_connections
        );

        for _ in 0..self.config.min_connections {
            if !self.pool.try_reserve_slot() {
                break;
            }
            let node = Arc::clone(self);
            thread::spawn(move || node.open_parked_connection());
        }

        let node = Arc::clone(self);
        thread::spawn(move || sweeper_loop(node));
        Ok(())
    }

    /// Stop the node
    ///
    /// Idle connections close immediately. A connection carrying a command
    /// stays up until its exchange finishes, then closes instead of
    /// returning to the pool. The node reaches [`NodeState::Shutdown`] once
    /// the last reader thread has exited; use [`Node::await_state`] to
    /// block on that.
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        self.transition_from(
            "stop",
            &[NodeState::Running, NodeState::HealthChecking],
            NodeState::ShuttingDown,
        )?;
        info!("Node {} shutting down", self.config.addr);

        // Dropping the sender disconnects the sweeper and probe loops.
        self.shutdown_tx.lock().take();
        for conn in self.pool.drain_idle() {
            conn.close();
        }
        self.maybe_finish_shutdown();
        Ok(())
    }

    /// Block until the node reaches `target`, or the timeout passes
    pub fn await_state(&self, target: NodeState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != target {
            if self
                .state_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return *state == target;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Command Execution
    // -------------------------------------------------------------------------

    /// Try to execute a command on this node
    ///
    /// Returns `Ok(true)` when the node has taken ownership of the command:
    /// from then on exactly one of the command's completion hooks will fire,
    /// possibly after a cluster-level retry. Returns `Ok(false)` when the
    /// pool is saturated and the caller should try another node. Errors
    /// only on a lifecycle violation.
    ///
    /// Valid while [`NodeState::Running`] or [`NodeState::HealthChecking`]:
    /// a probing node still serves from whatever idle connections it kept.
    pub fn execute(self: &Arc<Self>, command: Arc<dyn StoreCommand>) -> Result<bool> {
        let state = self.state();
        if !matches!(state, NodeState::Running | NodeState::HealthChecking) {
            return Err(NimbusError::StateViolation {
                operation: "execute",
                actual: state.to_string(),
                allowed: format!("{}, {}", NodeState::Running, NodeState::HealthChecking),
            });
        }

        if let Some(conn) = self.pool.checkout() {
            self.executing.fetch_add(1, Ordering::SeqCst);
            self.dispatch_on(conn, command);
            return Ok(true);
        }

        if !self.pool.try_reserve_slot() {
            debug!(
                "Node {} saturated at {} connections",
                self.config.addr, self.config.max_connections
            );
            return Ok(false);
        }

        // Connect off-thread so a slow or unbounded connect never blocks
        // the caller. The command is owned from here on: a connect failure
        // spends one attempt and fails over like any other transport error.
        self.executing.fetch_add(1, Ordering::SeqCst);
        let node = Arc::clone(self);
        thread::spawn(move || match node.connect_reserved() {
            Ok(conn) => node.dispatch_on(conn, command),
            Err(e) => {
                warn!("Node {} connect failed: {}", node.config.addr, e);
                node.executing.fetch_sub(1, Ordering::SeqCst);
                node.record_connect_failure();
                node.fail_over(command, RetryCause::Client(e));
            }
        });
        Ok(true)
    }

    /// Write the command onto a connection it now owns
    fn dispatch_on(self: &Arc<Self>, conn: Arc<Connection>, command: Arc<dyn StoreCommand>) {
        if let Err(e) = conn.execute(Arc::clone(&command)) {
            // The request may have reached the wire, so the attempt
            // stands and the command fails over.
            self.executing.fetch_sub(1, Ordering::SeqCst);
            conn.close();
            self.fail_over(command, RetryCause::Client(e));
        }
    }

    /// Classify a response frame against the connection's in-flight command
    pub(crate) fn handle_response(self: &Arc<Self>, conn: &Arc<Connection>, message: Message) {
        let Some(command) = conn.current_command() else {
            warn!(
                "Node {} got unsolicited frame 0x{:02x} on connection {}, closing it",
                self.config.addr,
                message.code,
                conn.id()
            );
            conn.close();
            return;
        };

        if message.code == codes::ERROR_RESP {
            conn.clear_in_flight();
            self.executing.fetch_sub(1, Ordering::SeqCst);
            self.return_connection(conn);
            let cause = match decode_error(&message) {
                Ok(err) => {
                    debug!(
                        "Node {} command {} rejected by server: {}",
                        self.config.addr,
                        command.name(),
                        err
                    );
                    RetryCause::Server(err)
                }
                Err(e) => RetryCause::Client(e),
            };
            self.fail_over(command, cause);
            return;
        }

        if message.code != command.expected_code() {
            conn.clear_in_flight();
            self.executing.fetch_sub(1, Ordering::SeqCst);
            self.return_connection(conn);
            let err = NimbusError::Protocol(format!(
                "command {} expected opcode 0x{:02x}, got 0x{:02x}",
                command.name(),
                command.expected_code(),
                message.code
            ));
            self.fail_over(command, RetryCause::Client(err));
            return;
        }

        conn.touch();
        if command.on_success(message) {
            conn.clear_in_flight();
            self.executing.fetch_sub(1, Ordering::SeqCst);
            self.return_connection(conn);
        }
    }

    /// Park a finished connection, or close it while the node is draining
    fn return_connection(&self, conn: &Arc<Connection>) {
        self.pool.release(Arc::clone(conn));
        // Re-check after parking: a stop racing this return must not
        // leave a parked connection behind.
        if matches!(
            self.state(),
            NodeState::ShuttingDown | NodeState::Shutdown
        ) {
            for conn in self.pool.drain_idle() {
                conn.close();
            }
        }
    }

    /// Account for a reader thread exiting
    ///
    /// `deliberate` is true when the close came from this side (idle
    /// expiry, shutdown) rather than from the peer or a wire fault.
    pub(crate) fn handle_connection_closed(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        deliberate: bool,
    ) {
        self.pool.discard(conn);

        // A close this side never asked for means the server dropped us;
        // verify it before taking more traffic. The transition happens
        // before any retry dispatch so re-selection already sees this
        // node as unavailable.
        if !deliberate {
            warn!(
                "Node {} lost connection {} unexpectedly",
                self.config.addr,
                conn.id()
            );
            self.enter_health_checking();
        }

        if let Some(command) = conn.clear_in_flight() {
            self.executing.fetch_sub(1, Ordering::SeqCst);
            let err = NimbusError::Connection("connection closed while executing".to_string());
            self.fail_over(command, RetryCause::Client(err));
        }

        self.maybe_finish_shutdown();
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Turn a connection's pool slot reservation into live accounting
    ///
    /// Called by [`Connection::establish`] before its reader thread starts,
    /// so the reader's exit path always sees a registered connection. A
    /// successful connect also ends any consecutive-failure streak.
    pub(crate) fn register_connection(&self, conn: &Arc<Connection>) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.pool.adopt(conn);
    }

    /// Open a connection for an already-reserved pool slot
    fn connect_reserved(self: &Arc<Self>) -> Result<Arc<Connection>> {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let hook = self.connect_hook.lock().clone();
        Connection::establish(id, &self.config, Arc::downgrade(self), hook.as_deref()).map_err(
            |e| {
                self.pool.abandon_slot();
                e
            },
        )
    }

    /// Warm-up connect: open a connection and park it in the idle queue
    fn open_parked_connection(self: &Arc<Self>) {
        match self.connect_reserved() {
            Ok(conn) => self.return_connection(&conn),
            Err(e) => {
                warn!("Node {} warm connect failed: {}", self.config.addr, e);
                self.record_connect_failure();
                self.maybe_finish_shutdown();
            }
        }
    }

    /// Top the pool back up to the warm floor
    fn replenish(self: &Arc<Self>) {
        if self.state() != NodeState::Running {
            return;
        }
        while self.pool.live_count() + self.pool.pending_count() < self.config.min_connections {
            if !self.pool.try_reserve_slot() {
                break;
            }
            let node = Arc::clone(self);
            thread::spawn(move || node.open_parked_connection());
        }
    }

    /// Hand a failed command back for re-selection, or deliver terminally
    fn fail_over(self: &Arc<Self>, command: Arc<dyn StoreCommand>, cause: RetryCause) {
        let retry_tx = self.retry_tx.lock().clone();
        let cause = match retry_tx {
            Some(tx) => {
                let ticket = RetryTicket {
                    command: Arc::clone(&command),
                    failed: Arc::clone(self),
                    cause,
                };
                match tx.send(ticket) {
                    Ok(()) => {
                        self.events.publish(CoreEvent::RetryTriggered {
                            command: command.name().to_string(),
                            failed_addr: self.config.addr.clone(),
                        });
                        return;
                    }
                    // Router gone; fall through to terminal delivery.
                    Err(err) => err.0.cause,
                }
            }
            None => cause,
        };
        cause.deliver(command.as_ref());
    }

    /// Count one more failed connect; at the threshold the node goes probing
    ///
    /// Server rejections and protocol mismatches never land here: they are
    /// command failures, not evidence the server itself is unreachable.
    fn record_connect_failure(self: &Arc<Self>) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold {
            warn!(
                "Node {} hit {} consecutive connect failures",
                self.config.addr, failures
            );
            self.enter_health_checking();
        }
    }

    /// Start probing if the node is running; no-op in any other state
    fn enter_health_checking(self: &Arc<Self>) {
        if self.try_transition(NodeState::Running, NodeState::HealthChecking) {
            let node = Arc::clone(self);
            thread::spawn(move || probe_loop(node));
        }
    }

    fn maybe_finish_shutdown(&self) {
        if self.pool.live_count() == 0 && self.pool.pending_count() == 0 {
            self.try_transition(NodeState::ShuttingDown, NodeState::Shutdown);
        }
    }

    /// Validated transition; fails with a state violation naming `operation`
    fn transition_from(
        &self,
        operation: &'static str,
        allowed: &[NodeState],
        next: NodeState,
    ) -> Result<()> {
        let from;
        {
            let mut state = self.state.lock();
            if !allowed.contains(&*state) {
                return Err(NimbusError::StateViolation {
                    operation,
                    actual: state.to_string(),
                    allowed: allowed
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
            from = *state;
            *state = next;
            self.state_cv.notify_all();
        }
        self.publish_state_change(from, next);
        Ok(())
    }

    /// Transition only if the node is still in `from`
    fn try_transition(&self, from: NodeState, to: NodeState) -> bool {
        {
            let mut state = self.state.lock();
            if *state != from {
                return false;
            }
            *state = to;
            self.state_cv.notify_all();
        }
        self.publish_state_change(from, to);
        true
    }

    fn publish_state_change(&self, from: NodeState, to: NodeState) {
        self.events.publish(CoreEvent::NodeStateChanged {
            addr: self.config.addr.clone(),
            from,
            to,
        });
    }

    /// One blocking probe exchange on a fresh socket
    fn run_probe(&self) -> Result<()> {
        let command: Arc<dyn StoreCommand> = match self.probe_factory.lock().clone() {
            Some(factory) => factory(),
            None => PingCommand::new().0,
        };

        let addr = self.config.socket_addr()?;
        let timeout = self.config.health_check_interval();
        let connect_timeout = self.config.connect_timeout().unwrap_or(timeout);
        let mut stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        if let Some(hook) = self.connect_hook.lock().clone() {
            hook(&stream)?;
        }
        stream.set_read_timeout(Some(timeout))?;

        write_message(&mut stream, &command.build_request())?;
        loop {
            let message = read_message(&mut stream)?;
            if message.code == codes::ERROR_RESP {
                let err = decode_error(&message)?;
                return Err(err.into());
            }
            if message.code != command.expected_code() {
                return Err(NimbusError::Protocol(format!(
                    "probe expected opcode 0x{:02x}, got 0x{:02x}",
                    command.expected_code(),
                    message.code
                )));
            }
            if command.on_success(message) {
                return Ok(());
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.config.addr)
            .field("state", &self.state())
            .field("live", &self.pool.live_count())
            .field("idle", &self.pool.idle_count())
            .field("executing", &self.execute_count())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for conn in self.pool.snapshot() {
            conn.close();
        }
    }
}

// =============================================================================
// Background Loops
// =============================================================================

/// Close idle connections past their timeout, keeping the warm floor
fn sweeper_loop(node: Arc<Node>) {
    let ticker = crossbeam::channel::tick(node.config.expiry_interval());
    loop {
        select! {
            recv(ticker) -> _ => {
                if matches!(node.state(), NodeState::ShuttingDown | NodeState::Shutdown) {
                    return;
                }
                let expired = node
                    .pool
                    .take_expired(node.config.idle_timeout(), node.config.min_connections);
                for conn in expired {
                    debug!(
                        "Node {} expiring idle connection {}",
                        node.config.addr,
                        conn.id()
                    );
                    conn.close();
                }
                node.replenish();
            }
            recv(node.shutdown_rx) -> _ => return,
        }
    }
}

/// Probe the server until it answers, then resume running
fn probe_loop(node: Arc<Node>) {
    let interval = node.config.health_check_interval();
    loop {
        if node.state() != NodeState::HealthChecking {
            return;
        }
        match node.run_probe() {
            Ok(()) => {
                if node.try_transition(NodeState::HealthChecking, NodeState::Running) {
                    node.consecutive_failures.store(0, Ordering::SeqCst);
                    info!("Node {} answered its probe, resuming", node.config.addr);
                }
                return;
            }
            Err(e) => {
                debug!("Node {} probe failed: {}", node.config.addr, e);
            }
        }
        select! {
            recv(node.shutdown_rx) -> _ => return,
            default(interval) => {}
        }
    }
}
