//! Single-slot completion signal.
//!
//! This is the one intentional wait in the download path: the loop arms the
//! slot for a file, starts the transfer and waits, bounded by the per-file
//! timeout, until the event pump releases the slot with the transfer result.
//! [`CompletionSignal::cancel`] force-releases a waiting loop and stays in
//! effect until [`CompletionSignal::reset`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Result of [`CompletionSignal::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The transport reported completion; `true` on success.
    Completed(bool),
    /// No result within the timeout.
    TimedOut,
    /// Cancelled while waiting.
    Cancelled,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Armed(String),
    Released(bool),
    Cancelled,
}

/// Single-slot latch between the download loop and the event pump.
#[derive(Debug)]
pub struct CompletionSignal {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    /// Idle signal.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            notify: Notify::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expect a completion for `name`. Returns `false` if cancelled.
    pub fn arm(&self, name: &str) -> bool {
        let mut slot = self.slot();
        if matches!(*slot, Slot::Cancelled) {
            return false;
        }
        *slot = Slot::Armed(name.to_string());
        true
    }

    /// Stop expecting a completion (the transfer never started).
    pub fn disarm(&self) {
        let mut slot = self.slot();
        if !matches!(*slot, Slot::Cancelled) {
            *slot = Slot::Idle;
        }
    }

    /// Deliver the result for `name`.
    ///
    /// Ignored unless the slot is armed for `name`, so a late completion of
    /// an abandoned transfer cannot release the wait for another file.
    pub fn release(&self, name: &str, success: bool) -> bool {
        let mut slot = self.slot();
        if !matches!(&*slot, Slot::Armed(armed) if armed == name) {
            return false;
        }
        *slot = Slot::Released(success);
        drop(slot);
        self.notify.notify_one();
        true
    }

    /// Force-release any waiter and refuse further arming.
    pub fn cancel(&self) {
        *self.slot() = Slot::Cancelled;
        self.notify.notify_one();
    }

    /// Whether [`cancel`](Self::cancel) is in effect.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.slot(), Slot::Cancelled)
    }

    /// Back to idle, clearing a previous cancellation.
    pub fn reset(&self) {
        *self.slot() = Slot::Idle;
    }

    /// Wait for release or cancellation, at most `timeout`.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.take_outcome() {
                return outcome;
            }
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.take_outcome().unwrap_or_else(|| {
                    *self.slot() = Slot::Idle;
                    WaitOutcome::TimedOut
                });
            }
        }
    }

    fn take_outcome(&self) -> Option<WaitOutcome> {
        let mut slot = self.slot();
        let outcome = match &*slot {
            Slot::Released(success) => WaitOutcome::Completed(*success),
            Slot::Cancelled => return Some(WaitOutcome::Cancelled),
            Slot::Idle | Slot::Armed(_) => return None,
        };
        *slot = Slot::Idle;
        Some(outcome)
    }
}
