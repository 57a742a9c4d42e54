//! Command contract
//!
//! A command owns one request/response exchange end to end: it renders the
//! request frame, names the response opcode it expects, and absorbs whatever
//! comes back. The runtime never interprets payloads; it only routes frames
//! to the command that is in flight.
//!
//! ## Responsibilities
//!
//! - Define the [`StoreCommand`] trait implemented by every operation
//! - Track per-command retry budgets armed at cluster dispatch
//! - Provide built-in commands for the standard key/value operations
//!
//! Callers hold commands behind `Arc`, so results come back through a
//! channel handed out by the command's constructor rather than by return
//! value. Each built-in command sends exactly one terminal outcome.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::NimbusError;
use crate::protocol::{ErrorMessage, Message};

mod kv;
mod ping;

pub use kv::{DeleteCommand, FetchCommand, ListKeysCommand, PutCommand};
pub use ping::PingCommand;

// =============================================================================
// Command Trait
// =============================================================================

/// A single request/response exchange against the store
///
/// Implementations are shared across threads (`Arc<dyn StoreCommand>`), so
/// every hook takes `&self` and interior state must be synchronized. The
/// runtime guarantees that for one command, at most one hook runs at a time.
///
/// Exactly one terminal hook fires per execution: the final [`on_success`]
/// (the one returning `true`), [`on_server_error`], or [`on_error`].
///
/// [`on_success`]: StoreCommand::on_success
/// [`on_server_error`]: StoreCommand::on_server_error
/// [`on_error`]: StoreCommand::on_error
pub trait StoreCommand: Send + Sync {
    /// Short operation name used in logs and events
    fn name(&self) -> &'static str;

    /// Render the request frame
    ///
    /// Called once per dispatch; a retried command is asked to render again.
    fn build_request(&self) -> Message;

    /// Opcode of the response frame this command expects
    fn expected_code(&self) -> u8;

    /// Absorb a response frame carrying the expected opcode
    ///
    /// Returns `true` when the command is complete. Streaming commands
    /// return `false` to keep the connection reserved for further frames.
    fn on_success(&self, response: Message) -> bool;

    /// Terminal delivery of a server-reported error
    fn on_server_error(&self, err: ErrorMessage);

    /// Terminal delivery of a client-side failure
    fn on_error(&self, err: NimbusError);

    /// Retry budget armed by the cluster at dispatch time
    fn budget(&self) -> &RetryBudget;
}

// =============================================================================
// Retry Budget
// =============================================================================

/// Re-dispatches remaining for one command
///
/// Armed once by [`Cluster::execute`] with the configured attempts minus
/// the initial execution, and consumed by the retry router per
/// re-dispatch. A node that fails a command never touches the budget; it
/// hands the command back and the router decides whether another attempt
/// remains.
///
/// [`Cluster::execute`]: crate::cluster::Cluster::execute
#[derive(Debug, Default)]
pub struct RetryBudget {
    remaining: AtomicU32,
}

impl RetryBudget {
    /// Create an unarmed budget (zero attempts)
    pub const fn new() -> Self {
        Self {
            remaining: AtomicU32::new(0),
        }
    }

    /// Set the number of attempts available
    pub fn arm(&self, attempts: u32) {
        self.remaining.store(attempts, Ordering::SeqCst);
    }

    /// Consume one attempt, returning false when none remain
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Attempts still available
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }
}
