//! Completion handles for asynchronous writer operations.
//!
//! `connect_async`, `disconnect_async`, `read_async` and `write_async`
//! return a [`CompletionHandle`] immediately; the engine resolves it when
//! the operation terminates. Cancellation is best-effort: the continuation
//! observes the attached [`CancelToken`] between OS calls and while
//! blocked in one, but a completion that has already happened wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};

use crate::error::{FramewireError, Result};

/// One-shot sink resolved by the engine when an operation finishes.
pub type CompletionSink<T> = oneshot::Sender<Result<T>>;

/// Cancellation token attached to an in-flight operation.
///
/// Cheaply cloneable; all clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to an asynchronous operation in flight.
///
/// Await the result with [`wait`](CompletionHandle::wait); trigger
/// best-effort cancellation with [`cancel`](CompletionHandle::cancel).
/// A caller wanting a timeout races `wait()` against its own timer and
/// cancels on expiry.
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    cancel: CancelToken,
}

impl<T> CompletionHandle<T> {
    /// Create a handle/sink pair plus the cancel token the continuation
    /// should observe.
    pub(crate) fn new() -> (Self, CompletionSink<T>, CancelToken) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancelToken::new();
        let handle = Self {
            rx,
            cancel: cancel.clone(),
        };
        (handle, tx, cancel)
    }

    /// Request cancellation of the underlying operation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested on this handle.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the operation to terminate.
    ///
    /// A continuation that is torn down without resolving its sink (the
    /// endpoint was disposed mid-flight) surfaces as
    /// [`FramewireError::Shutdown`].
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FramewireError::Shutdown),
        }
    }
}

/// Resolve a sink, tolerating an abandoned handle.
///
/// The caller may have dropped its [`CompletionHandle`] without waiting;
/// that is not an engine error.
pub(crate) fn resolve<T>(sink: CompletionSink<T>, result: Result<T>) {
    let _ = sink.send(result);
}
