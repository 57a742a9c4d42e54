//! Node selection strategies
//!
//! A selector decides which node gets the next command. Selection and
//! dispatch are one operation: the selector walks its preferred order and
//! offers the command to each node until one accepts, so a saturated or
//! non-running node costs nothing but the next candidate.
//!
//! On a retry the node that already failed the command is dropped from
//! the order outright, even when that leaves no candidate. It stays
//! eligible only when it is the only node in the list.
//!
//! Strategies are shared without locking: what little state they keep
//! lives in atomics, and no lock is held while a command is written to
//! a socket.

use std::sync::Arc;

use crate::command::StoreCommand;
use crate::config::SelectorKind;
use crate::node::Node;

mod least_executing;
mod round_robin;

pub use least_executing::LeastExecutingSelector;
pub use round_robin::RoundRobinSelector;

/// Strategy for routing a command onto one of the cluster's nodes
pub trait NodeSelector: Send + Sync {
    /// Strategy name used in logs
    fn name(&self) -> &'static str;

    /// Offer `command` to nodes in preference order until one accepts
    ///
    /// `previously_tried` is the node a retried command already failed on.
    /// Returns `true` once a node has taken ownership of the command,
    /// `false` when every candidate declined.
    fn select_and_execute(
        &self,
        nodes: &[Arc<Node>],
        command: Arc<dyn StoreCommand>,
        previously_tried: Option<&Arc<Node>>,
    ) -> bool;
}

/// Build the selector for a configured strategy
pub fn build(kind: SelectorKind) -> Box<dyn NodeSelector> {
    match kind {
        SelectorKind::RoundRobin => Box::new(RoundRobinSelector::new()),
        SelectorKind::LeastExecuting => Box::new(LeastExecutingSelector::new()),
    }
}

/// Preference order shared by the strategies: drop the node that already
/// failed this command, unless it is the only node there is.
fn exclude_previously_tried(
    order: &mut Vec<usize>,
    nodes: &[Arc<Node>],
    previously_tried: Option<&Arc<Node>>,
) {
    let Some(prev) = previously_tried else {
        return;
    };
    if nodes.len() < 2 {
        return;
    }
    if let Some(pos) = order.iter().position(|&i| Arc::ptr_eq(&nodes[i], prev)) {
        order.remove(pos);
    }
}
