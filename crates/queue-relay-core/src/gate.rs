//! Concurrency gate bounding the number of open deliveries.
//!
//! The counter is shared by the dispatcher and every delivery task. Admission
//! checks and increments under one lock, so the open count never exceeds the
//! limit. Waiters sleep-poll at [`POLL_INTERVAL`] and are woken early when a
//! permit is released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;

/// Fixed interval between admission checks while the gate is full
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counting gate with a fixed limit.
#[derive(Debug)]
pub struct ConcurrencyGate {
    open: Mutex<usize>,
    limit: usize,
    released: Notify,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `limit` concurrent holders
    pub fn new(limit: usize) -> Self {
        Self {
            open: Mutex::new(0),
            limit,
            released: Notify::new(),
        }
    }

    /// Current number of open deliveries
    pub fn value(&self) -> usize {
        *self.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Adjust the counter by `delta` and return the new value.
    ///
    /// The counter saturates at zero; an adjustment that would take it below
    /// zero is logged and clamped.
    pub fn add(&self, delta: isize) -> usize {
        let mut open = self.lock();
        let current = *open;
        *open = match current.checked_add_signed(delta) {
            Some(value) => value,
            None if delta < 0 => {
                warn!(
                    open = current,
                    delta, "Concurrency gate decremented below zero, clamping"
                );
                0
            }
            None => usize::MAX,
        };
        let value = *open;
        drop(open);

        if delta < 0 {
            self.released.notify_one();
        }
        value
    }

    /// Take a slot if one is free
    pub fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        let mut open = self.lock();
        if *open < self.limit {
            *open += 1;
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Wait until a slot is free and take it
    pub async fn acquire(self: &Arc<Self>) -> GatePermit {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }

            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A held gate slot, released on drop
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.add(-1);
    }
}
