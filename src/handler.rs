//! Request handler contract - the reader's sole extension point.
//!
//! A handler is invoked once per fully received frame, on the completion
//! worker driving that connection; it holds that worker until it returns,
//! so it must not block indefinitely.
//!
//! # Example
//!
//! ```
//! use framewire::RequestHandler;
//!
//! // An echo handler: copy the request into the response and send it.
//! let echo = |_peer: std::net::SocketAddr, request: &[u8], response: &mut bytes::BytesMut| {
//!     response.extend_from_slice(request);
//!     true
//! };
//! fn assert_handler(_h: impl RequestHandler) {}
//! assert_handler(echo);
//! ```

use std::net::SocketAddr;

use bytes::BytesMut;

/// User-supplied callback invoked per received request.
///
/// `response` arrives empty with the reader's `packet_buffer_size` bytes
/// of capacity; the handler appends the response payload. Returning `true`
/// sends the response back to the peer; `false` makes the exchange
/// fire-and-forget. Writing more than `packet_buffer_size` bytes is a
/// contract violation and closes the connection.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request frame from `peer`.
    fn handle(&self, peer: SocketAddr, request: &[u8], response: &mut BytesMut) -> bool;
}

impl<F> RequestHandler for F
where
    F: Fn(SocketAddr, &[u8], &mut BytesMut) -> bool + Send + Sync + 'static,
{
    fn handle(&self, peer: SocketAddr, request: &[u8], response: &mut BytesMut) -> bool {
        self(peer, request, response)
    }
}
