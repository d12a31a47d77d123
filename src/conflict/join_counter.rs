use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Completion barrier for fire-and-forget work.
///
/// The counter starts at one, standing for the producer that is still
/// dispatching work. Every dispatched task calls `register` before it starts
/// and `arrive` when it finishes; the producer calls `arrive_and_wait` once it
/// has nothing more to dispatch and resumes when the count reaches zero.
///
/// Only the producer may wait on the counter.
#[derive(Debug)]
pub struct JoinCounter {
    pending: AtomicUsize,
    zero: Notify,
}

impl Default for JoinCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinCounter {
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(1),
            zero: Notify::new(),
        }
    }

    /// Accounts for one more outstanding task.
    pub fn register(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks one task (or the producer) as finished.
    pub fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            // notify_one keeps a permit when the producer is not parked yet.
            self.zero.notify_one();
        }
    }

    /// Number of parties that have not arrived yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Arrives for the producer and waits until every registered task arrived.
    pub async fn arrive_and_wait(&self) {
        self.arrive();
        while self.pending() != 0 {
            self.zero.notified().await;
        }
    }
}
