//! One-shot shutdown signal shared by an endpoint's continuations.
//!
//! Every continuation consults the signal before issuing its next OS call;
//! once set it stays set for the lifetime of the endpoint object. Blocked
//! operations race [`ShutdownSignal::signalled`] in a `select!` so a
//! pending accept or read does not outlive `stop()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Process-wide-for-this-endpoint cancellation signal.
///
/// Cheaply cloneable; all clones observe the same flag.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Default)]
struct SignalState {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Idempotent; wakes every waiter.
    pub fn signal(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has been set.
    #[inline]
    pub fn is_signalled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolve once the signal is set. Usable from any number of waiters
    /// and after the fact (a set signal resolves immediately).
    pub async fn signalled(&self) {
        // Register interest before the flag check so a concurrent signal()
        // between check and await cannot be missed.
        loop {
            let notified = self.inner.notify.notified();
            if self.is_signalled() {
                return;
            }
            notified.await;
        }
    }
}
