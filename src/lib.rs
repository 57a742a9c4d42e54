//! # NimbusKV
//!
//! A client runtime for distributed key-value stores with:
//! - Pooled, length-prefixed binary protocol connections
//! - Per-node lifecycle management with automatic health checking
//! - Pluggable node selection (round-robin, least-executing)
//! - Cluster-level retries that prefer a node the command has not tried
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Cluster                               │
//! │           (selector + retry router + event bus)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │    Node     │          │    Node     │
//!   │ (pool + HC) │          │ (pool + HC) │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ Connections │          │ Connections │
//!   │ (1 in-flight│          │ (1 in-flight│
//!   │  each)      │          │  each)      │
//!   └─────────────┘          └─────────────┘
//! ```
//!
//! Commands implement [`command::StoreCommand`] and travel as
//! `Arc<dyn StoreCommand>`; results come back through the channel each
//! command hands out at construction.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod cluster;
pub mod command;
pub mod connection;
pub mod events;
pub mod node;
pub mod protocol;
pub mod selector;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cluster::{Cluster, ClusterState};
pub use command::{
    DeleteCommand, FetchCommand, ListKeysCommand, PingCommand, PutCommand, StoreCommand,
};
pub use config::{ClusterConfig, NodeConfig, SelectorKind};
pub use error::{NimbusError, Result};
pub use events::{CoreEvent, EventBus};
pub use node::{Node, NodeState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of NimbusKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
