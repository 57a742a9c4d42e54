//! Lifecycle events
//!
//! The observable side channel of the core: node state changes, cluster
//! node-set changes, and retry dispatches. Events fan out over plain
//! channels so monitoring collaborators can consume them without the core
//! depending on any particular sink.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::node::NodeState;

/// A lifecycle event emitted by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreEvent {
    /// A node moved between lifecycle states
    NodeStateChanged {
        addr: String,
        from: NodeState,
        to: NodeState,
    },

    /// A node joined the cluster's node set
    NodeAdded { addr: String },

    /// A node left the cluster's node set
    NodeRemoved { addr: String },

    /// A command failed on one node and was handed back for re-selection
    RetryTriggered {
        command: String,
        failed_addr: String,
    },
}

/// Fan-out distributor for [`CoreEvent`]s
///
/// Each subscriber gets its own unbounded channel; publishing clones the
/// event per subscriber and prunes receivers that have been dropped.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<CoreEvent>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return its receiving end
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: CoreEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
