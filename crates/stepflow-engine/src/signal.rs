//! In-process signal delivery backing the `send_signal` submission-API call
//! and the `wait` action kind's signal mode (§4.4, §6).
//!
//! Grounded on the same dashmap-keyed, lock-per-entry pattern as
//! [`crate::tenant::TenantScheduler`]: one broker instance is shared by the
//! `Engine` facade and handed to every run as its `Collaborators::signal_waiter`.
//! A signal sent before anyone is waiting is buffered rather than dropped,
//! since `send_signal` and the `wait` step's dispatch are not ordered with
//! respect to each other.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use stepflow_actions::SignalWaiter;
use stepflow_types::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

enum Slot {
    /// Senders of in-flight `wait_for` calls, oldest first.
    Waiting(Vec<oneshot::Sender<Value>>),
    /// Payloads that arrived with nobody waiting yet.
    Buffered(VecDeque<Value>),
}

/// Keyed by `(run_id, signal_name)` - a run may wait on several distinct
/// signal names concurrently (e.g. two separate `wait` steps).
#[derive(Default)]
pub struct SignalBroker {
    slots: DashMap<(Uuid, String), Slot>,
}

impl SignalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` for `signal_name` on `run_id`. Wakes the oldest
    /// waiter if one is blocked in `wait_for`; otherwise buffers it for the
    /// next `wait_for` call on the same key.
    pub fn send_signal(&self, run_id: Uuid, signal_name: &str, payload: Value) {
        let key = (run_id, signal_name.to_string());
        let mut slot = self.slots.entry(key).or_insert_with(|| Slot::Buffered(VecDeque::new()));
        match &mut *slot {
            Slot::Waiting(waiters) if !waiters.is_empty() => {
                let tx = waiters.remove(0);
                let _ = tx.send(payload);
            }
            Slot::Waiting(_) => {
                *slot = Slot::Buffered(VecDeque::from([payload]));
            }
            Slot::Buffered(queue) => queue.push_back(payload),
        }
    }

    /// Drop any buffered-but-undelivered signals and abandoned waiters for a
    /// run that has reached a terminal state, so the broker doesn't grow
    /// unbounded across the engine's lifetime.
    pub fn forget_run(&self, run_id: Uuid) {
        self.slots.retain(|(id, _), _| *id != run_id);
    }
}

#[async_trait]
impl SignalWaiter for SignalBroker {
    async fn wait_for(&self, run_id: Uuid, signal_name: &str, cancel: CancellationToken) -> Option<Value> {
        let key = (run_id, signal_name.to_string());

        let rx = {
            let mut slot = self.slots.entry(key).or_insert_with(|| Slot::Waiting(Vec::new()));
            if let Slot::Buffered(queue) = &mut *slot {
                if let Some(payload) = queue.pop_front() {
                    return Some(payload);
                }
            }
            let (tx, rx) = oneshot::channel();
            match &mut *slot {
                Slot::Waiting(waiters) => waiters.push(tx),
                Slot::Buffered(_) => *slot = Slot::Waiting(vec![tx]),
            }
            rx
        };

        tokio::select! {
            result = rx => result.ok(),
            _ = cancel.cancelled() => None,
        }
    }
}
