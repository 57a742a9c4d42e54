//! Connection pool bookkeeping
//!
//! Tracks every established connection plus an idle queue, and two
//! counters: `live` (established connections, idle or checked out) and
//! `pending` (connects in progress). A slot is reserved before any connect
//! starts, and an adopted connection is counted live before its
//! reservation is surrendered, so the cap holds no matter how many
//! threads race.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::Connection;

#[derive(Debug)]
pub(crate) struct ConnectionPool {
    /// Every live connection, whether idle or checked out
    all: Mutex<Vec<Arc<Connection>>>,
    /// Connections available for checkout, oldest first
    idle: Mutex<VecDeque<Arc<Connection>>>,
    live: AtomicUsize,
    pending: AtomicUsize,
    max: usize,
}

impl ConnectionPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            all: Mutex::new(Vec::new()),
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            max,
        }
    }

    /// Check out the oldest idle connection, skipping any that died in place
    pub(crate) fn checkout(&self) -> Option<Arc<Connection>> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop_front() {
            if !conn.is_closed() {
                return Some(conn);
            }
            // Closed while idle; the reader exit path owns the accounting.
        }
        None
    }

    /// Return a checked-out connection to the idle queue
    pub(crate) fn release(&self, conn: Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        conn.touch();
        self.idle.lock().push_back(conn);
    }

    /// Reserve a slot for a new connect, failing when the pool is at max
    pub(crate) fn try_reserve_slot(&self) -> bool {
        loop {
            let pending = self.pending.load(Ordering::SeqCst);
            let live = self.live.load(Ordering::SeqCst);
            if live + pending >= self.max {
                return false;
            }
            if self
                .pending
                .compare_exchange(pending, pending + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Convert a reserved slot into a live connection
    ///
    /// `live` rises before `pending` falls: the sum a racing reserve reads
    /// can transiently run one high, never one low.
    pub(crate) fn adopt(&self, conn: &Arc<Connection>) {
        self.all.lock().push(Arc::clone(conn));
        self.live.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Give back a reserved slot after a failed connect
    pub(crate) fn abandon_slot(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drop a connection from the accounting after its reader exited
    ///
    /// Called exactly once per connection, from the reader's exit path.
    pub(crate) fn discard(&self, conn: &Connection) {
        self.all.lock().retain(|c| c.id() != conn.id());
        self.idle.lock().retain(|c| c.id() != conn.id());
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Empty the idle queue for shutdown
    ///
    /// The connections stay registered until their readers exit; only the
    /// checkout path loses sight of them.
    pub(crate) fn drain_idle(&self) -> Vec<Arc<Connection>> {
        self.idle.lock().drain(..).collect()
    }

    /// Pull idle connections unused longer than `timeout`
    ///
    /// Never reaps below `floor` live connections, so the warm minimum
    /// survives quiet periods. Oldest connections go first.
    pub(crate) fn take_expired(&self, timeout: Duration, floor: usize) -> Vec<Arc<Connection>> {
        let mut idle = self.idle.lock();
        let mut budget = self.live_count().saturating_sub(floor);
        let mut expired = Vec::new();
        idle.retain(|conn| {
            if budget > 0 && conn.idle_for() > timeout {
                budget -= 1;
                expired.push(Arc::clone(conn));
                false
            } else {
                true
            }
        });
        expired
    }

    /// Snapshot every live connection, idle or checked out
    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.all.lock().clone()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
