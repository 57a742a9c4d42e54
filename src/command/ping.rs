//! Ping command
//!
//! Empty-payload liveness probe. Doubles as the default health check a node
//! sends while verifying a suspect server.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::error::{NimbusError, Result};
use crate::protocol::{codes, ErrorMessage, Message};

use super::{RetryBudget, StoreCommand};

/// Liveness check against a single server
pub struct PingCommand {
    budget: RetryBudget,
    done_tx: Sender<Result<()>>,
}

impl PingCommand {
    /// Create a ping together with the receiver its outcome arrives on
    pub fn new() -> (Arc<Self>, Receiver<Result<()>>) {
        let (done_tx, done_rx) = bounded(1);
        let cmd = Arc::new(Self {
            budget: RetryBudget::new(),
            done_tx,
        });
        (cmd, done_rx)
    }
}

impl StoreCommand for PingCommand {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn build_request(&self) -> Message {
        Message::empty(codes::PING_REQ)
    }

    fn expected_code(&self) -> u8 {
        codes::PING_RESP
    }

    fn on_success(&self, _response: Message) -> bool {
        let _ = self.done_tx.send(Ok(()));
        true
    }

    fn on_server_error(&self, err: ErrorMessage) {
        let _ = self.done_tx.send(Err(err.into()));
    }

    fn on_error(&self, err: NimbusError) {
        let _ = self.done_tx.send(Err(err));
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }
}
