//! Least-executing selection

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::trace;

use crate::command::StoreCommand;
use crate::node::{Node, NodeState};

use super::{exclude_previously_tried, NodeSelector};

/// Prefer the node with the fewest commands in flight
///
/// Load counts are snapshotted once per selection. Nodes with equal load
/// are tried in random order so an idle cluster spreads its first burst
/// instead of hammering the first node in the list.
#[derive(Debug, Default)]
pub struct LeastExecutingSelector;

impl LeastExecutingSelector {
    pub fn new() -> Self {
        Self
    }
}

impl NodeSelector for LeastExecutingSelector {
    fn name(&self) -> &'static str {
        "least-executing"
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

        // Shuffle first, then stable-sort by load: ties keep their
        // shuffled order, which is exactly a random tie-break.
        let mut ranked: Vec<(usize, usize)> = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (idx, node.execute_count()))
            .collect();
        ranked.shuffle(&mut rand::thread_rng());
        ranked.sort_by_key(|&(_, load)| load);

        let mut order: Vec<usize> = ranked.into_iter().map(|(idx, _)| idx).collect();
        exclude_previously_tried(&mut order, nodes, previously_tried);

        for idx in order {
            let node = &nodes[idx];
            if node.state() != NodeState::Running {
                continue;
            }
            if matches!(node.execute(Arc::clone(&command)), Ok(true)) {
                trace!(
                    "least-executing dispatched {} to {} (load {})",
                    command.name(),
                    node.addr(),
                    node.execute_count()
                );
                return true;
            }
        }
        false
    }
}
