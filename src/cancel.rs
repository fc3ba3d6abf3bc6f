//! Cooperative cancellation shared by every long-running thread.
//!
//! Nothing in the crate terminates a thread forcibly. Loops poll a
//! [`CancelToken`] at their iteration boundary and sleep through
//! [`CancelToken::sleep`], which wakes at least every [`POLL_GRANULARITY`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Longest stretch a cancellable sleep goes without checking its token.
pub const POLL_GRANULARITY: Duration = Duration::from_millis(20);

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration` in slices of at most [`POLL_GRANULARITY`].
    ///
    /// Returns `true` when the full duration elapsed, `false` as soon as the
    /// token is observed cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(POLL_GRANULARITY));
        }
    }
}
