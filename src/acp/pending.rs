//! Correlation table for outstanding requests.
//!
//! Request ids are unique for the lifetime of a connection. Resolving or
//! failing an unknown id is a silent no-op: duplicate or late responses must
//! not panic or corrupt state. On connection death every still-registered
//! slot is dropped exactly once, which the awaiting side observes as
//! `ConnectionLost`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::acp::protocol::JsonRpcError;
use crate::log;

/// Outcome delivered to a waiting caller: the remote result payload or the
/// remote's own error response.
pub type RpcOutcome = Result<Value, JsonRpcError>;

pub struct PendingRequests {
    next_id: AtomicU64,
    inner: Mutex<PendingInner>,
}

struct PendingInner {
    slots: HashMap<u64, oneshot::Sender<RpcOutcome>>,
    dead: bool,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(PendingInner {
                slots: HashMap::new(),
                dead: false,
            }),
        }
    }

    /// Allocate a fresh request id and a resolution slot.
    ///
    /// When the connection is already dead the returned receiver resolves
    /// immediately as lost (the sender is dropped on the spot).
    pub fn register(&self) -> (u64, oneshot::Receiver<RpcOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut inner = self.inner.lock().unwrap();
        if !inner.dead {
            inner.slots.insert(id, tx);
        }
        (id, rx)
    }

    /// Deliver a response to the waiting caller. No-op for unknown ids.
    pub fn resolve(&self, id: u64, outcome: RpcOutcome) {
        let slot = self.inner.lock().unwrap().slots.remove(&id);
        match slot {
            Some(tx) => {
                // The caller may have abandoned the wait (deadline elapsed);
                // a failed send is not an error.
                let _ = tx.send(outcome);
            }
            None => log::log_event(&format!("response for unknown request id {}", id)),
        }
    }

    /// Remove a slot whose caller stopped waiting. A response arriving later
    /// becomes a no-op resolution.
    pub fn abandon(&self, id: u64) {
        self.inner.lock().unwrap().slots.remove(&id);
    }

    /// Fail every outstanding request with connection loss, exactly once,
    /// and refuse all future registrations.
    pub fn fail_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.dead = true;
        // Dropping the senders resolves every receiver as ConnectionLost.
        inner.slots.clear();
    }

    /// Number of requests still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}
