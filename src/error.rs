//! Error types for framewire.

use std::io;

use thiserror::Error;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    /// Construction-time argument out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Caller-supplied buffer exceeds the configured maximum.
    #[error("buffer of {len} bytes exceeds maximum of {max}")]
    BufferTooLarge { len: usize, max: usize },

    /// Decoded payload length is zero or exceeds the configured maximum.
    #[error("malformed frame header: payload length {length} (max {max})")]
    MalformedHeader { length: u32, max: usize },

    /// The peer closed the socket (zero-byte read or write).
    #[error("peer closed the connection")]
    PeerClosed,

    /// Any other OS socket error.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Cooperative cancellation was observed before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    /// The endpoint is stopping; the operation was not started.
    #[error("endpoint is shutting down")]
    Shutdown,
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;

/// Map an OS socket error into the crate taxonomy.
///
/// Aborted operations (the kinds the OS reports when an in-flight call is
/// torn down under it) become [`FramewireError::Cancelled`]; everything
/// else is a [`FramewireError::Transport`].
pub fn map_io_error(err: io::Error) -> FramewireError {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => FramewireError::Cancelled,
        _ => FramewireError::Transport(err),
    }
}

/// Whether an accept-loop error is a reset from a half-open peer.
///
/// These are routine on internet-facing listeners (SYN scans, clients that
/// give up while still in the backlog) and are re-armed without surfacing.
pub fn is_connection_reset(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionReset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_aborted_to_cancelled() {
        let err = io::Error::new(io::ErrorKind::ConnectionAborted, "aborted");
        assert!(matches!(map_io_error(err), FramewireError::Cancelled));

        let err = io::Error::new(io::ErrorKind::Interrupted, "interrupted");
        assert!(matches!(map_io_error(err), FramewireError::Cancelled));
    }

    #[test]
    fn test_map_other_to_transport() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        match map_io_error(err) {
            FramewireError::Transport(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::BrokenPipe)
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[test]
    fn test_connection_reset_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(is_connection_reset(&reset));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_connection_reset(&refused));
    }

    #[test]
    fn test_error_display() {
        let err = FramewireError::BufferTooLarge { len: 10, max: 5 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains('5'));

        let err = FramewireError::MalformedHeader {
            length: 0,
            max: 4096,
        };
        assert!(err.to_string().contains("payload length 0"));
    }
}
