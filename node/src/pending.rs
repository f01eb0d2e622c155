//! Correlation of outgoing requests with their responses.
//!
//! Every call registers a one-shot slot under a fresh lock id before the request is sent.
//! The receive loop completes the slot when a response carrying that id arrives; the caller
//! waits on it with a fixed timeout. A slot is completed at most once and disappears as soon
//! as it is completed, cancelled, or abandoned, so a late response for an expired call finds
//! nothing and is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chord_lib::LockId;
use tokio::sync::oneshot;

use crate::error::{ChordError, Result};

pub type ResponseSlot<R> = oneshot::Receiver<R>;

struct PendingState<R> {
    next_lock_id: LockId,
    waiting: HashMap<LockId, oneshot::Sender<R>>,
}

pub struct PendingCalls<R> {
    state: Mutex<PendingState<R>>,
}

impl<R> Default for PendingCalls<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> PendingCalls<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                next_lock_id: 0,
                waiting: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PendingState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a lock id and installs the slot its response will be delivered to.
    pub fn register(&self) -> (LockId, ResponseSlot<R>) {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state();
        let lock_id = state.next_lock_id;
        state.next_lock_id = state.next_lock_id.wrapping_add(1);
        state.waiting.insert(lock_id, sender);
        (lock_id, receiver)
    }

    /// Delivers `response` to the call waiting on `lock_id`.
    ///
    /// Returns `false` when nobody is waiting any more: unknown id, duplicate response, or a
    /// call that already timed out.
    pub fn fulfill(&self, lock_id: LockId, response: R) -> bool {
        let sender = self.state().waiting.remove(&lock_id);
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, lock_id: LockId) -> bool {
        self.state().waiting.remove(&lock_id).is_some()
    }

    /// Drops every slot, waking all waiters with a disconnection. Returns how many were
    /// still waiting.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.state().waiting.drain().collect();
        drained.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state().waiting.len()
    }

    /// Waits for the response registered under `lock_id`, for at most `timeout`.
    pub async fn wait(
        &self,
        lock_id: LockId,
        slot: ResponseSlot<R>,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<R> {
        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChordError::Disconnected(format!(
                "call {} ({}) abandoned",
                lock_id, operation
            ))),
            Err(_) => {
                self.cancel(lock_id);
                Err(ChordError::Timeout { operation, timeout })
            }
        }
    }
}
