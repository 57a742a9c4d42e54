//! Selector Tests
//!
//! Dispatch order, skipping, retry exclusion, and tie-breaking for the
//! round-robin and least-executing strategies, driven directly against
//! started nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nimbuskv::command::PingCommand;
use nimbuskv::selector::{build, NodeSelector};
use nimbuskv::{Node, SelectorKind};

fn started_node(addr: &str) -> Arc<Node> {
    let node = Node::new(common::node_config(addr)).unwrap();
    node.start().unwrap();
    node
}

/// Dispatch one ping through the selector and wait for its outcome
fn ping_via(selector: &dyn NodeSelector, nodes: &[Arc<Node>]) {
    let (cmd, rx) = PingCommand::new();
    assert!(selector.select_and_execute(nodes, cmd, None));
    rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
}

// =============================================================================
// Round-Robin Tests
// =============================================================================

#[test]
fn test_round_robin_rotates_through_nodes() {
    let servers = [common::kv_server(), common::kv_server(), common::kv_server()];
    let nodes: Vec<Arc<Node>> = servers.iter().map(|s| started_node(s.addr())).collect();

    // Six dispatches visit node0, node1, node2 in strict cyclic order,
    // twice around; the counts are checked after every single dispatch.
    let selector = build(SelectorKind::RoundRobin);
    let mut expected = [0usize; 3];
    for turn in 0..6 {
        ping_via(selector.as_ref(), &nodes);
        expected[turn % 3] += 1;
        for (server, want) in servers.iter().zip(expected) {
            assert_eq!(server.request_count(), want);
        }
    }

    for node in &nodes {
        node.stop().unwrap();
    }
}

#[test]
fn test_round_robin_skips_non_running_nodes() {
    let servers = [common::kv_server(), common::kv_server(), common::kv_server()];
    let first = started_node(servers[0].addr());
    // Middle node exists but was never started
    let second = Node::new(common::node_config(servers[1].addr())).unwrap();
    let third = started_node(servers[2].addr());
    let nodes = vec![Arc::clone(&first), second, Arc::clone(&third)];

    let selector = build(SelectorKind::RoundRobin);
    for _ in 0..4 {
        ping_via(selector.as_ref(), &nodes);
    }

    assert_eq!(servers[0].request_count(), 2);
    assert_eq!(servers[1].request_count(), 0);
    assert_eq!(servers[2].request_count(), 2);

    first.stop().unwrap();
    third.stop().unwrap();
}

#[test]
fn test_round_robin_cursor_survives_shrinking_list() {
    let servers = [
        common::kv_server(),
        common::kv_server(),
        common::kv_server(),
        common::kv_server(),
    ];
    let nodes: Vec<Arc<Node>> = servers.iter().map(|s| started_node(s.addr())).collect();

    let selector = build(SelectorKind::RoundRobin);
    // Advance the cursor toward the half about to disappear
    ping_via(selector.as_ref(), &nodes);
    ping_via(selector.as_ref(), &nodes);

    // Shrink to two nodes: the stale cursor clamps instead of panicking,
    // and rotation alternates cleanly over the survivors
    let remaining: Vec<Arc<Node>> = nodes[..2].to_vec();
    for _ in 0..4 {
        ping_via(selector.as_ref(), &remaining);
    }

    assert_eq!(servers[0].request_count(), 3);
    assert_eq!(servers[1].request_count(), 3);
    assert_eq!(servers[2].request_count(), 0);
    assert_eq!(servers[3].request_count(), 0);

    for node in &nodes {
        node.stop().unwrap();
    }
}

// =============================================================================
// Least-Executing Tests
// =============================================================================

#[test]
fn test_least_executing_prefers_idle_node() {
    let busy_server = common::silent_server();
    let idle_server = common::kv_server();
    let busy = started_node(busy_server.addr());
    let idle = started_node(idle_server.addr());

    // Park one command on the busy node so its load stays at one
    let (held, _held_rx) = PingCommand::new();
    assert!(busy.execute(held).unwrap());
    assert_eq!(busy.execute_count(), 1);

    let nodes = vec![Arc::clone(&busy), Arc::clone(&idle)];
    let selector = build(SelectorKind::LeastExecuting);
    for _ in 0..5 {
        ping_via(selector.as_ref(), &nodes);
    }

    assert_eq!(idle_server.request_count(), 5);
    assert_eq!(busy.execute_count(), 1);

    busy.stop().unwrap();
    idle.stop().unwrap();
}

#[test]
fn test_least_executing_picks_lightest_of_three() {
    let servers = [
        common::silent_server(),
        common::silent_server(),
        common::silent_server(),
    ];
    let nodes: Vec<Arc<Node>> = servers.iter().map(|s| started_node(s.addr())).collect();

    // Park held pings on the silent servers to grade the loads
    let mut held = Vec::new();
    for (node, load) in nodes.iter().zip([3usize, 2, 1]) {
        for _ in 0..load {
            let (cmd, rx) = PingCommand::new();
            assert!(node.execute(cmd).unwrap());
            held.push(rx);
        }
    }
    assert_eq!(nodes[0].execute_count(), 3);
    assert_eq!(nodes[1].execute_count(), 2);
    assert_eq!(nodes[2].execute_count(), 1);

    // The next dispatch must land on the node carrying the least work
    let selector = build(SelectorKind::LeastExecuting);
    let (cmd, _rx) = PingCommand::new();
    assert!(selector.select_and_execute(&nodes, cmd, None));

    assert_eq!(nodes[0].execute_count(), 3);
    assert_eq!(nodes[1].execute_count(), 2);
    assert_eq!(nodes[2].execute_count(), 2);

    for node in &nodes {
        node.stop().unwrap();
    }
}

#[test]
fn test_least_executing_randomizes_ties() {
    let servers = [common::kv_server(), common::kv_server()];
    let nodes: Vec<Arc<Node>> = servers.iter().map(|s| started_node(s.addr())).collect();

    // With loads tied at zero every round, 20 dispatches all landing on
    // one node would mean the tie-break is not random.
    let selector = build(SelectorKind::LeastExecuting);
    for _ in 0..20 {
        ping_via(selector.as_ref(), &nodes);
    }

    assert!(servers[0].request_count() >= 1);
    assert!(servers[1].request_count() >= 1);
    assert_eq!(
        servers[0].request_count() + servers[1].request_count(),
        20
    );

    for node in &nodes {
        node.stop().unwrap();
    }
}

// =============================================================================
// Shared Behavior Tests
// =============================================================================

#[test]
fn test_failed_node_not_repicked_while_others_remain() {
    let servers = [common::kv_server(), common::kv_server(), common::kv_server()];
    let nodes: Vec<Arc<Node>> = servers.iter().map(|s| started_node(s.addr())).collect();

    for kind in [SelectorKind::RoundRobin, SelectorKind::LeastExecuting] {
        let selector = build(kind);
        for _ in 0..6 {
            let (cmd, rx) = PingCommand::new();
            assert!(selector.select_and_execute(&nodes, cmd, Some(&nodes[0])));
            rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        }
    }

    // Twelve retry dispatches, none back on the node that already failed
    assert_eq!(servers[0].request_count(), 0);
    assert_eq!(servers[1].request_count() + servers[2].request_count(), 12);

    for node in &nodes {
        node.stop().unwrap();
    }
}

#[test]
fn test_retry_declines_rather_than_repick_failed_node() {
    let servers = [common::kv_server(), common::kv_server()];
    // The only running node is the one the command already failed on;
    // with another node in the list it must not be picked again, even
    // though nothing else can take the command.
    let cold = Node::new(common::node_config(servers[0].addr())).unwrap();
    let running = started_node(servers[1].addr());
    let nodes = vec![cold, Arc::clone(&running)];

    for kind in [SelectorKind::RoundRobin, SelectorKind::LeastExecuting] {
        let selector = build(kind);
        let (cmd, _rx) = PingCommand::new();
        assert!(!selector.select_and_execute(&nodes, cmd, Some(&running)));
    }
    assert_eq!(servers[0].request_count(), 0);
    assert_eq!(servers[1].request_count(), 0);

    running.stop().unwrap();
}

#[test]
fn test_previously_tried_node_still_eligible_when_alone() {
    let server = common::kv_server();
    let node = started_node(server.addr());
    let nodes = vec![Arc::clone(&node)];

    let selector = build(SelectorKind::RoundRobin);
    let (cmd, rx) = PingCommand::new();
    assert!(selector.select_and_execute(&nodes, cmd, Some(&nodes[0])));
    rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(server.request_count(), 1);

    node.stop().unwrap();
}

#[test]
fn test_empty_node_list_declines() {
    let nodes: Vec<Arc<Node>> = Vec::new();
    for kind in [SelectorKind::RoundRobin, SelectorKind::LeastExecuting] {
        let selector = build(kind);
        let (cmd, _rx) = PingCommand::new();
        assert!(!selector.select_and_execute(&nodes, cmd, None));
    }
}

#[test]
fn test_no_running_node_declines() {
    let servers = [common::kv_server(), common::kv_server()];
    let nodes: Vec<Arc<Node>> = servers
        .iter()
        .map(|s| Node::new(common::node_config(s.addr())).unwrap())
        .collect();

    for kind in [SelectorKind::RoundRobin, SelectorKind::LeastExecuting] {
        let selector = build(kind);
        let (cmd, _rx) = PingCommand::new();
        assert!(!selector.select_and_execute(&nodes, cmd, None));
    }
    assert_eq!(servers[0].request_count(), 0);
    assert_eq!(servers[1].request_count(), 0);
}
