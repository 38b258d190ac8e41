//! Completion state objects and their user tokens.
//!
//! A [`TransferState`] is the bag of per-operation state threaded through
//! every partial I/O completion: the rented buffer, the running byte
//! counter, the operation kind, and a [`UserToken`] telling the completion
//! path what to resolve when the operation terminates. State objects are
//! rented from an [`ObjectPool`] before an operation is issued and given
//! back once it terminates - success, error, or cancellation - so that the
//! per-frame cost at target throughput is a pool pop, not an allocation.
//!
//! Exactly one I/O is in flight per state object at a time; the token is a
//! tagged sum held in a single field because the pool stores homogeneous
//! objects.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::completion::CompletionSink;
use crate::pool::{ObjectPool, PoolHooks, PooledBuffer};

/// Kind of operation a state object is currently attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Accept,
    Connect,
    Disconnect,
    Receive,
    Send,
}

/// Tagged discriminator inside a state object.
///
/// One variant per operation kind; the completion path consumes it to
/// resolve the right sink with the right payload.
pub enum UserToken {
    /// Accept has no user payload.
    Accept,
    /// Resolved when the connect finishes.
    Connect(CompletionSink<()>),
    /// Resolved when the disconnect finishes.
    Disconnect(CompletionSink<()>),
    /// Client-side receive: delivers the received payload.
    Read {
        sink: CompletionSink<TransmissionResult>,
        /// Bytes already read into the rented transmission buffer.
        total_read: usize,
    },
    /// Client-side send: delivers `bytes_written`.
    Write {
        sink: CompletionSink<usize>,
        /// Bytes already sent from the rented transmission buffer.
        total_written: usize,
    },
    /// Reader-side transfer; the reader never surfaces per-message
    /// completion sinks outward.
    ServerTransmission { total: usize },
}

impl std::fmt::Debug for UserToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserToken::Accept => f.write_str("Accept"),
            UserToken::Connect(_) => f.write_str("Connect"),
            UserToken::Disconnect(_) => f.write_str("Disconnect"),
            UserToken::Read { total_read, .. } => {
                write!(f, "Read {{ total_read: {total_read} }}")
            }
            UserToken::Write { total_written, .. } => {
                write!(f, "Write {{ total_written: {total_written} }}")
            }
            UserToken::ServerTransmission { total } => {
                write!(f, "ServerTransmission {{ total: {total} }}")
            }
        }
    }
}

/// Value carried back from a completed transmission.
#[derive(Debug, Clone)]
pub struct TransmissionResult {
    /// Bytes moved across the socket for this operation's payload.
    pub bytes_transferred: usize,
    /// The remote endpoint of the exchange.
    pub peer: SocketAddr,
    /// Zero-copy view of the payload involved.
    pub buffer_view: Bytes,
}

/// Per-operation completion state, pooled via [`state_pool`].
pub struct TransferState {
    /// Current operation, `None` while parked in the pool.
    pub op: Option<OperationKind>,
    /// Current user token, `None` while parked or already consumed.
    pub token: Option<UserToken>,
    /// Rented transmission buffer, at most one per in-flight I/O.
    pub buffer: Option<PooledBuffer>,
    /// Running counter of bytes moved so far in this operation.
    pub bytes_transferred: usize,
    /// Destination / peer endpoint of the operation.
    pub endpoint: SocketAddr,
}

impl TransferState {
    /// Fresh state object, parked.
    pub fn new(default_endpoint: SocketAddr) -> Self {
        Self {
            op: None,
            token: None,
            buffer: None,
            bytes_transferred: 0,
            endpoint: default_endpoint,
        }
    }

    /// Attach an operation and its token before issuing the first OS call.
    pub fn begin(&mut self, op: OperationKind, token: UserToken, endpoint: SocketAddr) {
        self.op = Some(op);
        self.token = Some(token);
        self.bytes_transferred = 0;
        self.endpoint = endpoint;
    }

    /// Consume the token for resolution at operation end.
    pub fn take_token(&mut self) -> Option<UserToken> {
        self.token.take()
    }

    /// Detach the rented buffer (to copy out of it, or to return it).
    pub fn take_buffer(&mut self) -> Option<PooledBuffer> {
        self.buffer.take()
    }

    /// Whether the object carries no operation remnants.
    pub fn is_parked(&self) -> bool {
        self.op.is_none() && self.token.is_none() && self.buffer.is_none()
    }

    /// Scrub back to the parked state. Dropping the buffer slot sends the
    /// buffer back to its own pool.
    pub fn park(&mut self, default_endpoint: SocketAddr) {
        self.op = None;
        self.token = None;
        self.buffer = None;
        self.bytes_transferred = 0;
        self.endpoint = default_endpoint;
    }
}

/// Build the completion state pool for one endpoint.
///
/// The four hooks: create parked objects at `default_endpoint`, reset by
/// parking, reuse only objects whose operation fully detached its token
/// and buffer, destroy by dropping.
pub fn state_pool(default_endpoint: SocketAddr, preallocate: usize) -> ObjectPool<TransferState> {
    let hooks = PoolHooks::new(
        move || TransferState::new(default_endpoint),
        move |state: &mut TransferState| state.park(default_endpoint),
        |state: &mut TransferState| state.token.is_none() && state.buffer.is_none(),
        drop,
    );
    ObjectPool::new(hooks, preallocate)
}

/// Cap on consecutive inline continuations of a partial-I/O loop.
pub(crate) const INLINE_CONTINUATION_LIMIT: u32 = 16;

/// Guard against monopolising a worker when the OS keeps completing
/// inline. After [`INLINE_CONTINUATION_LIMIT`] consecutive continuations
/// the chain escalates to the scheduler via `yield_now`.
pub(crate) struct InlineGuard {
    streak: u32,
}

impl InlineGuard {
    pub(crate) fn new() -> Self {
        Self { streak: 0 }
    }

    pub(crate) async fn tick(&mut self) {
        self.streak += 1;
        if self.streak >= INLINE_CONTINUATION_LIMIT {
            self.streak = 0;
            tokio::task::yield_now().await;
        }
    }
}
