//! Table of requests awaiting a response, keyed by request id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::SessionError;

pub(crate) type Outcome = Result<Value, SessionError>;

/// Every entry leaves the table exactly once: completed by a response,
/// removed by cancellation, or failed in bulk when the session goes down.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Outcome>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: u64) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Delivers an outcome. Returns `false` if `id` was not pending.
    pub fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            return false;
        };
        // The waiter may have given up already; the entry is gone either way.
        let _ = tx.send(outcome);
        true
    }

    /// Drops the entry without delivering anything.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fails every pending entry and returns how many there were.
    pub fn fail_all(&self, mut error: impl FnMut() -> SessionError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
