//! Error types for the NimbusKV client
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using NimbusError
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Unified error type for NimbusKV client operations
#[derive(Debug, Error)]
pub enum NimbusError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Wire Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection already has a command in flight")]
    AlreadyInFlight,

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Invalid operation '{operation}' in state {actual} (allowed: {allowed})")]
    StateViolation {
        operation: &'static str,
        actual: String,
        allowed: String,
    },

    // -------------------------------------------------------------------------
    // Cluster Errors
    // -------------------------------------------------------------------------
    #[error("No nodes available to execute command")]
    NoNodesAvailable,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Command failed after {0} attempts: {1}")]
    AttemptsExhausted(u32, String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
