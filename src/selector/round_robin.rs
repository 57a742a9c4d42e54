//! Round-robin selection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::command::StoreCommand;
use crate::node::{Node, NodeState};

use super::{exclude_previously_tried, NodeSelector};

/// Rotate through the node list, remembering where the last dispatch landed
///
/// Each call examines every node at most once, starting just past the node
/// that accepted the previous command. The cursor clamps back to the front
/// when the node list shrinks underneath it.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl NodeSelector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select_and_execute(
        &self,
        nodes: &[Arc<Node>],
        command: Arc<dyn StoreCommand>,
        previously_tried: Option<&Arc<Node>>,
    ) -> bool {
        if nodes.is_empty() {
            return false;
        }
        let len = nodes.len();
        let mut start = self.cursor.load(Ordering::SeqCst);
        if start >= len {
            start = 0;
        }

        let mut order: Vec<usize> = (0..len).map(|offset| (start + offset) % len).collect();
        exclude_previously_tried(&mut order, nodes, previously_tried);

        for idx in order {
            let node = &nodes[idx];
            if node.state() != NodeState::Running {
                continue;
            }
            if matches!(node.execute(Arc::clone(&command)), Ok(true)) {
                trace!("round-robin dispatched {} to {}", command.name(), node.addr());
                self.cursor.store((idx + 1) % len, Ordering::SeqCst);
                return true;
            }
        }
        false
    }
}
