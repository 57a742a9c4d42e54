//! Configuration for the NimbusKV client
//!
//! Centralized configuration with sensible defaults. All tunables are plain
//! data so deployments can load node topology from files via serde.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NimbusError, Result};

/// Default server address (the NimbusKV protocol port).
pub const DEFAULT_ADDR: &str = "127.0.0.1:8087";

/// Configuration for a single Node (one server address and its pool)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    // -------------------------------------------------------------------------
    // Addressing
    // -------------------------------------------------------------------------
    /// Server address (host:port)
    pub addr: String,

    // -------------------------------------------------------------------------
    // Pool Configuration
    // -------------------------------------------------------------------------
    /// Connections established eagerly at start and kept through idle expiry
    pub min_connections: usize,

    /// Hard cap on simultaneous connections (pooled + in-use + connecting)
    pub max_connections: usize,

    /// Idle age after which a connection above the minimum is closed (ms)
    pub idle_timeout_ms: u64,

    /// TCP connect timeout in milliseconds (0 = no timeout)
    pub connect_timeout_ms: u64,

    /// Interval between idle-expiry sweeps (ms)
    pub expiry_interval_ms: u64,

    // -------------------------------------------------------------------------
    // Health Check Configuration
    // -------------------------------------------------------------------------
    /// Consecutive connect failures before the node enters health checking
    pub failure_threshold: u32,

    /// Interval between health-check probe attempts (ms)
    pub health_check_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            min_connections: 1,
            max_connections: 10_000,
            idle_timeout_ms: 3000,
            connect_timeout_ms: 0,
            expiry_interval_ms: 1000,
            failure_threshold: 5,
            health_check_interval_ms: 1000,
        }
    }
}

impl NodeConfig {
    /// Create a new config builder
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Idle timeout as a Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Connect timeout as a Duration (None when 0, meaning no timeout)
    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.connect_timeout_ms))
        }
    }

    /// Expiry sweep interval as a Duration
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }

    /// Health-check probe interval as a Duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Resolve the configured address, hostnames included
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .to_socket_addrs()
            .map_err(|e| NimbusError::Config(format!("invalid address {}: {}", self.addr, e)))?
            .next()
            .ok_or_else(|| {
                NimbusError::Config(format!("address {} resolves to nothing", self.addr))
            })
    }

    /// Validate the configuration
    ///
    /// Checked synchronously at Node construction so malformed settings
    /// never reach the network layer.
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.max_connections == 0 {
            return Err(NimbusError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(NimbusError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.expiry_interval_ms == 0 {
            return Err(NimbusError::Config(
                "expiry_interval_ms must be nonzero".to_string(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(NimbusError::Config(
                "health_check_interval_ms must be nonzero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for NodeConfig
#[derive(Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Set the server address (host:port)
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Set the minimum connection count
    pub fn min_connections(mut self, count: usize) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set the maximum connection count
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the idle timeout (in milliseconds)
    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    /// Set the connect timeout (in milliseconds, 0 = no timeout)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    /// Set the idle-expiry sweep interval (in milliseconds)
    pub fn expiry_interval_ms(mut self, ms: u64) -> Self {
        self.config.expiry_interval_ms = ms;
        self
    }

    /// Set the consecutive-failure threshold for health checking
    pub fn failure_threshold(mut self, count: u32) -> Self {
        self.config.failure_threshold = count;
        self
    }

    /// Set the health-check probe interval (in milliseconds)
    pub fn health_check_interval_ms(mut self, ms: u64) -> Self {
        self.config.health_check_interval_ms = ms;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

/// Node selection policy, chosen at Cluster construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorKind {
    /// Rotate through nodes in order
    RoundRobin,

    /// Prefer the node with the fewest commands in flight
    LeastExecuting,
}

/// Configuration for a Cluster (the full node set plus routing policy)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node configurations, unique by address
    pub nodes: Vec<NodeConfig>,

    /// Total execution attempts per command (first try + retries)
    pub execution_attempts: u32,

    /// Node selection policy
    pub selector: SelectorKind,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::default()],
            execution_attempts: 3,
            selector: SelectorKind::RoundRobin,
        }
    }
}

impl ClusterConfig {
    /// Create a new config builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.execution_attempts == 0 {
            return Err(NimbusError::Config(
                "execution_attempts must be at least 1".to_string(),
            ));
        }

        for node in &self.nodes {
            node.validate()?;
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.addr.as_str()) {
                return Err(NimbusError::Config(format!(
                    "duplicate node address: {}",
                    node.addr
                )));
            }
        }

        Ok(())
    }
}

/// Builder for ClusterConfig
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl Default for ClusterConfigBuilder {
    fn default() -> Self {
        Self {
            config: ClusterConfig {
                nodes: Vec::new(),
                execution_attempts: 3,
                selector: SelectorKind::RoundRobin,
            },
        }
    }
}

impl ClusterConfigBuilder {
    /// Add a node by address with otherwise-default settings
    pub fn node_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.nodes.push(NodeConfig {
            addr: addr.into(),
            ..NodeConfig::default()
        });
        self
    }

    /// Add a fully specified node configuration
    pub fn node(mut self, node: NodeConfig) -> Self {
        self.config.nodes.push(node);
        self
    }

    /// Set the execution-attempt budget
    pub fn execution_attempts(mut self, attempts: u32) -> Self {
        self.config.execution_attempts = attempts;
        self
    }

    /// Set the node selection policy
    pub fn selector(mut self, kind: SelectorKind) -> Self {
        self.config.selector = kind;
        self
    }

    pub fn build(self) -> ClusterConfig {
        self.config
    }
}
