//! Cancellation token shared between a worker and whoever may stop it.

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returned from a cancellation point once cancellation has been requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cancelled: {reason}")]
pub struct Cancelled {
    /// The reason given to [`CancellationToken::cancel`].
    pub reason: String,
}

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
/// Threads blocked in [`wait`](Self::wait) or
/// [`wait_timeout`](Self::wait_timeout) are woken when it fires.
#[derive(Default)]
pub struct CancellationToken {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Paired with `wakeup` for blocking waits.
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// Returns true if this call performed the cancellation.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        {
            // Reason before flag: whoever sees the flag sees the reason
            let mut slot = self.reason.write();
            if self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            *slot = Some(reason.into());
            self.cancelled.store(true, Ordering::SeqCst);
        }

        let _guard = self.lock.lock();
        self.wakeup.notify_all();
        true
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(self.cancelled_error())
        } else {
            Ok(())
        }
    }

    /// Blocks until cancellation is requested.
    pub fn wait(&self) -> Cancelled {
        let mut guard = self.lock.lock();
        while !self.is_cancelled() {
            self.wakeup.wait(&mut guard);
        }
        drop(guard);
        self.cancelled_error()
    }

    /// Blocks for at most `timeout`, returning early on cancellation.
    ///
    /// Returns true if the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        let mut guard = self.lock.lock();
        while !self.is_cancelled() {
            if self.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return self.is_cancelled();
            }
        }
        true
    }

    fn cancelled_error(&self) -> Cancelled {
        Cancelled {
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
