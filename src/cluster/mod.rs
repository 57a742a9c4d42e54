//! Cluster management
//!
//! A [`Cluster`] groups the nodes of one logical store behind a single
//! execute call. It owns the selection strategy, the per-command attempt
//! budget, and a retry router that re-dispatches commands a node handed
//! back after a failure.
//!
//! ## Responsibilities
//!
//! - Build and start one [`Node`] per configured server
//! - Route commands through the configured [`NodeSelector`]
//! - Re-route failed commands, preferring a node that has not tried them
//! - Deliver the terminal failure once the attempt budget is spent
//! - Support adding and removing nodes while commands are in flight
//!
//! The router runs on its own thread fed by an unbounded channel, so a
//! node's reader thread never blocks on re-selection.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::StoreCommand;
use crate::config::{ClusterConfig, NodeConfig};
use crate::error::{NimbusError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::node::{Node, NodeState};
use crate::protocol::ErrorMessage;
use crate::selector::{self, NodeSelector};

// =============================================================================
// Retry Plumbing
// =============================================================================

/// Why a node handed a command back
#[derive(Debug)]
pub(crate) enum RetryCause {
    /// The server answered with an error frame
    Server(ErrorMessage),
    /// The command never got a usable answer
    Client(NimbusError),
}

impl RetryCause {
    /// Terminal delivery straight to the command's hooks
    pub(crate) fn deliver(self, command: &dyn StoreCommand) {
        match self {
            RetryCause::Server(err) => command.on_server_error(err),
            RetryCause::Client(err) => command.on_error(err),
        }
    }
}

/// A failed command on its way back to the router
pub(crate) struct RetryTicket {
    pub(crate) command: Arc<dyn StoreCommand>,
    pub(crate) failed: Arc<Node>,
    pub(crate) cause: RetryCause,
}

// =============================================================================
// Cluster State
// =============================================================================

/// Lifecycle state of a [`Cluster`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Created => "Created",
            ClusterState::Running => "Running",
            ClusterState::ShuttingDown => "ShuttingDown",
            ClusterState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// A set of nodes executing commands behind one dispatch call
pub struct Cluster {
    state: Mutex<ClusterState>,
    nodes: Mutex<Vec<Arc<Node>>>,
    /// Lock-free by contract: a selector blocks on socket writes, and a
    /// stalled write must not serialize every other dispatch.
    selector: Box<dyn NodeSelector>,
    attempts: u32,
    events: Arc<EventBus>,
    retry_tx: Mutex<Option<Sender<RetryTicket>>>,
}

impl Cluster {
    /// Build a cluster and its nodes; nothing connects until [`start`]
    ///
    /// [`start`]: Cluster::start
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let events = Arc::new(EventBus::new());
        let (retry_tx, retry_rx) = unbounded();

        let nodes = config
            .nodes
            .iter()
            .map(|node_config| {
                let node = Node::with_events(node_config.clone(), Arc::clone(&events))?;
                node.set_retry_channel(retry_tx.clone());
                Ok(node)
            })
            .collect::<Result<Vec<_>>>()?;

        let cluster = Arc::new(Self {
            state: Mutex::new(ClusterState::Created),
            nodes: Mutex::new(nodes),
            selector: selector::build(config.selector),
            attempts: config.execution_attempts,
            events,
            retry_tx: Mutex::new(Some(retry_tx)),
        });

        let weak = Arc::downgrade(&cluster);
        thread::spawn(move || router_loop(weak, retry_rx));
        Ok(cluster)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClusterState {
        *self.state.lock()
    }

    /// Event bus shared by the cluster and all its nodes
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Snapshot of the current node set
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().clone()
    }

    /// Number of nodes currently in the set
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Total attempts each command gets, the first execution included
    pub fn execution_attempts(&self) -> u32 {
        self.attempts
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start every node
    pub fn start(&self) -> Result<()> {
        self.transition_from("start", ClusterState::Created, ClusterState::Running)?;
        let nodes = self.nodes();
        info!(
            "Cluster starting {} nodes ({} strategy)",
            nodes.len(),
            self.selector.name()
        );
        for node in &nodes {
            node.start()?;
        }
        Ok(())
    }

    /// Stop every node and shut the retry router down
    ///
    /// Commands still in flight finish their exchanges while the nodes
    /// drain; once the router's queue is empty it exits. Use
    /// [`Cluster::await_shutdown`] to block until every node has fully
    /// drained.
    pub fn stop(&self) -> Result<()> {
        self.transition_from("stop", ClusterState::Running, ClusterState::ShuttingDown)?;
        info!("Cluster shutting down");
        for node in self.nodes() {
            if let Err(e) = node.stop() {
                debug!("Node {} was already stopping: {}", node.addr(), e);
            }
        }
        // Dropping our sender lets the router drain and exit once the
        // nodes have dropped theirs.
        self.retry_tx.lock().take();
        Ok(())
    }

    /// Block until every node reaches [`NodeState::Shutdown`]
    ///
    /// Returns false if the timeout passes first.
    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for node in self.nodes() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !node.await_state(NodeState::Shutdown, remaining) {
                return false;
            }
            node.clear_retry_channel();
        }
        self.try_transition(ClusterState::ShuttingDown, ClusterState::Shutdown);
        true
    }

    // -------------------------------------------------------------------------
    // Node Set
    // -------------------------------------------------------------------------

    /// Add a node, starting it immediately when the cluster is running
    pub fn add_node(&self, config: NodeConfig) -> Result<()> {
        let state = self.state();
        if !matches!(state, ClusterState::Created | ClusterState::Running) {
            return Err(NimbusError::StateViolation {
                operation: "add_node",
                actual: state.to_string(),
                allowed: "Created, Running".to_string(),
            });
        }

        let retry_tx = self
            .retry_tx
            .lock()
            .clone()
            .ok_or(NimbusError::Connection("cluster retry router is gone".to_string()))?;

        {
            let nodes = self.nodes.lock();
            if nodes.iter().any(|n| n.addr() == config.addr) {
                return Err(NimbusError::Config(format!(
                    "node {} is already in the cluster",
                    config.addr
                )));
            }
        }

        let addr = config.addr.clone();
        let node = Node::with_events(config, Arc::clone(&self.events))?;
        node.set_retry_channel(retry_tx);
        if self.state() == ClusterState::Running {
            node.start()?;
        }
        self.nodes.lock().push(node);

        info!("Cluster added node {}", addr);
        self.events.publish(CoreEvent::NodeAdded { addr });
        Ok(())
    }

    /// Remove a node by address, draining whatever it was executing
    pub fn remove_node(&self, addr: &str) -> Result<()> {
        let node = {
            let mut nodes = self.nodes.lock();
            let idx = nodes
                .iter()
                .position(|n| n.addr() == addr)
                .ok_or_else(|| NimbusError::NodeNotFound(addr.to_string()))?;
            nodes.remove(idx)
        };

        // A graceful stop drains the node: idle connections close now,
        // in-flight exchanges finish, and any that still fail re-route
        // to the nodes left in the set.
        if matches!(node.state(), NodeState::Running | NodeState::HealthChecking) {
            let _ = node.stop();
        }

        info!("Cluster removed node {}", addr);
        self.events.publish(CoreEvent::NodeRemoved {
            addr: addr.to_string(),
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Execute a command on a node chosen by the selection strategy
    ///
    /// Arms the command's retry budget with the configured attempts. On
    /// `Ok(())` the cluster owns the command and exactly one of its
    /// completion hooks will fire. Fails fast when no node can take the
    /// command right now.
    pub fn execute(&self, command: Arc<dyn StoreCommand>) -> Result<()> {
        let state = self.state();
        if state != ClusterState::Running {
            return Err(NimbusError::StateViolation {
                operation: "execute",
                actual: state.to_string(),
                allowed: ClusterState::Running.to_string(),
            });
        }

        // The budget holds re-dispatches; the initial execution is free.
        command.budget().arm(self.attempts.saturating_sub(1));

        let nodes = self.nodes();
        if self
            .selector
            .select_and_execute(&nodes, Arc::clone(&command), None)
        {
            Ok(())
        } else {
            Err(NimbusError::NoNodesAvailable)
        }
    }

    /// Re-dispatch or terminally fail a command a node handed back
    fn route_ticket(&self, ticket: RetryTicket) {
        let RetryTicket {
            command,
            failed,
            cause,
        } = ticket;

        if !command.budget().try_consume() {
            debug!(
                "Command {} spent all {} attempts, last failure on {}",
                command.name(),
                self.attempts,
                failed.addr()
            );
            match cause {
                RetryCause::Server(err) => command.on_server_error(err),
                RetryCause::Client(err) => {
                    command.on_error(NimbusError::AttemptsExhausted(self.attempts, err.to_string()))
                }
            }
            return;
        }

        debug!(
            "Retrying command {} away from {}",
            command.name(),
            failed.addr()
        );
        let nodes = self.nodes();
        let accepted = self
            .selector
            .select_and_execute(&nodes, Arc::clone(&command), Some(&failed));
        if !accepted {
            warn!(
                "No node could take command {} on retry",
                command.name()
            );
            command.on_error(NimbusError::NoNodesAvailable);
        }
    }

    fn transition_from(
        &self,
        operation: &'static str,
        expect: ClusterState,
        next: ClusterState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if *state != expect {
            return Err(NimbusError::StateViolation {
                operation,
                actual: state.to_string(),
                allowed: expect.to_string(),
            });
        }
        *state = next;
        Ok(())
    }

    fn try_transition(&self, from: ClusterState, to: ClusterState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state())
            .field("nodes", &self.node_count())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.retry_tx.lock().take();
        for node in self.nodes.lock().drain(..) {
            node.clear_retry_channel();
            if matches!(node.state(), NodeState::Running | NodeState::HealthChecking) {
                let _ = node.stop();
            }
        }
    }
}

// =============================================================================
// Retry Router
// =============================================================================

/// Drain retry tickets until every sender is gone
fn router_loop(cluster: Weak<Cluster>, rx: Receiver<RetryTicket>) {
    for ticket in rx.iter() {
        match cluster.upgrade() {
            Some(cluster) => cluster.route_ticket(ticket),
            // Cluster dropped mid-flight; the failure is terminal.
            None => ticket.cause.deliver(ticket.command.as_ref()),
        }
    }
    debug!("Cluster retry router stopped");
}
