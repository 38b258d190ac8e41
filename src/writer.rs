//! Client-side framed stream endpoint.
//!
//! A [`StreamWriter`] owns one outgoing TCP socket and exchanges framed
//! messages with a stream reader: connect / disconnect, framed write,
//! framed read, each in a synchronous (await-to-completion) and an
//! asynchronous ([`CompletionHandle`]) flavour.
//!
//! # Engine shape
//!
//! Every operation rents a completion state object and, for transfers, a
//! transmission buffer; the user payload is copied into the pooled buffer,
//! framed, and pushed through as many partial OS sends as the kernel needs.
//! Receives run the mirror image: header first, then exactly the declared
//! payload, then a copy out to the caller. A zero-byte transfer at any
//! point is the peer closing. The state object and buffer go back to their
//! pools when the operation terminates, no matter how.
//!
//! Operations are serialised per direction on the one socket; writes from
//! two tasks interleave frame-at-a-time, never byte-at-a-time.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;
use tokio::sync::Mutex;

use crate::completion::{resolve, CancelToken, CompletionHandle};
use crate::error::{map_io_error, FramewireError, Result};
use crate::pool::{BufferPool, ObjectPool};
use crate::protocol::{Header, ABSOLUTE_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::shutdown::ShutdownSignal;
use crate::transfer::{
    state_pool, InlineGuard, OperationKind, TransferState, TransmissionResult, UserToken,
};

/// Client-side bidirectional framed messenger over one TCP socket.
pub struct StreamWriter {
    shared: Arc<WriterShared>,
}

struct WriterShared {
    /// Unconnected socket; taken by `connect`, reinstalled by
    /// `disconnect(reuse_socket = true)`.
    socket: parking_lot::Mutex<Option<TcpSocket>>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    peer: parking_lot::Mutex<Option<SocketAddr>>,
    default_endpoint: SocketAddr,
    max_message_size: usize,
    buffers: BufferPool,
    states: ObjectPool<TransferState>,
    shutdown: ShutdownSignal,
}

impl StreamWriter {
    /// Create a writer around an unconnected socket.
    ///
    /// `max_message_size` bounds the payload of any single frame, in both
    /// directions; zero is rejected with
    /// [`FramewireError::InvalidConfig`]. `buffers_per_bucket` and
    /// `preallocated_states` size the transmission-buffer and
    /// completion-state pools.
    pub fn new(
        socket: TcpSocket,
        default_endpoint: SocketAddr,
        max_message_size: usize,
        buffers_per_bucket: usize,
        preallocated_states: usize,
    ) -> Result<Self> {
        if max_message_size == 0 {
            return Err(FramewireError::InvalidConfig(
                "max_message_size must be greater than zero",
            ));
        }
        if max_message_size > ABSOLUTE_MAX_PAYLOAD_SIZE {
            return Err(FramewireError::InvalidConfig(
                "max_message_size exceeds the absolute frame ceiling",
            ));
        }

        Ok(Self {
            shared: Arc::new(WriterShared {
                socket: parking_lot::Mutex::new(Some(socket)),
                read_half: Mutex::new(None),
                write_half: Mutex::new(None),
                peer: parking_lot::Mutex::new(None),
                default_endpoint,
                max_message_size,
                buffers: BufferPool::new(max_message_size + HEADER_SIZE, buffers_per_bucket),
                states: state_pool(default_endpoint, preallocated_states),
                shutdown: ShutdownSignal::new(),
            }),
        })
    }

    /// Bind the not-yet-connected socket to a local endpoint.
    pub fn bind(&self, local_endpoint: SocketAddr) -> Result<()> {
        let guard = self.shared.socket.lock();
        let socket = guard.as_ref().ok_or(FramewireError::InvalidConfig(
            "socket is already connected",
        ))?;
        socket.bind(local_endpoint).map_err(map_io_error)
    }

    /// Maximum payload bytes per frame.
    pub fn max_message_size(&self) -> usize {
        self.shared.max_message_size
    }

    /// The peer this writer is currently connected to, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.peer.lock()
    }

    /// Completion-state objects currently attached to in-flight operations.
    pub fn outstanding_operations(&self) -> usize {
        self.shared.states.outstanding_count()
    }

    /// Connect to `endpoint`, blocking until the TCP handshake finishes.
    pub async fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        self.connect_async(endpoint).wait().await
    }

    /// Initiate a connect; the handle resolves on completion.
    pub fn connect_async(&self, endpoint: SocketAddr) -> CompletionHandle<()> {
        let (handle, sink, cancel) = CompletionHandle::new();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let mut state = shared.states.rent();
            state.begin(OperationKind::Connect, UserToken::Connect(sink), endpoint);

            let outcome = do_connect(&shared, endpoint, &cancel).await;

            let token = state.take_token();
            shared.states.give_back(state);
            if let Some(UserToken::Connect(sink)) = token {
                resolve(sink, outcome);
            }
        });

        handle
    }

    /// Gracefully close the connection, blocking until done.
    ///
    /// With `reuse_socket = true` a fresh unconnected socket is installed
    /// so the writer can connect again.
    pub async fn disconnect(&self, reuse_socket: bool) -> Result<()> {
        self.disconnect_async(reuse_socket).wait().await
    }

    /// Initiate a graceful disconnect; the handle resolves on completion.
    pub fn disconnect_async(&self, reuse_socket: bool) -> CompletionHandle<()> {
        let (handle, sink, cancel) = CompletionHandle::new();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let endpoint = (*shared.peer.lock()).unwrap_or(shared.default_endpoint);
            let mut state = shared.states.rent();
            state.begin(
                OperationKind::Disconnect,
                UserToken::Disconnect(sink),
                endpoint,
            );

            let outcome = do_disconnect(&shared, reuse_socket, &cancel).await;

            let token = state.take_token();
            shared.states.give_back(state);
            if let Some(UserToken::Disconnect(sink)) = token {
                resolve(sink, outcome);
            }
        });

        handle
    }

    /// Send exactly `src.len()` bytes as one frame, blocking until the
    /// full frame is on the wire.
    ///
    /// The `endpoint` argument is informational for connection-oriented
    /// sockets; it is checked against the connected peer in debug builds.
    pub async fn write(&self, endpoint: SocketAddr, src: &[u8]) -> Result<TransmissionResult> {
        let bytes_written = self.write_async(endpoint, src).wait().await?;
        Ok(TransmissionResult {
            bytes_transferred: bytes_written,
            peer: self.peer_addr().unwrap_or(endpoint),
            buffer_view: Bytes::copy_from_slice(src),
        })
    }

    /// Initiate a framed send of `src`; resolves with `bytes_written`.
    pub fn write_async(&self, endpoint: SocketAddr, src: &[u8]) -> CompletionHandle<usize> {
        let (handle, sink, cancel) = CompletionHandle::new();

        if src.len() > self.shared.max_message_size {
            resolve(
                sink,
                Err(FramewireError::BufferTooLarge {
                    len: src.len(),
                    max: self.shared.max_message_size,
                }),
            );
            return handle;
        }
        if self.shared.shutdown.is_signalled() {
            resolve(sink, Err(FramewireError::Shutdown));
            return handle;
        }
        self.debug_assert_peer(endpoint);

        // Rent state and buffer, frame the payload, then hand the
        // continuation to the runtime.
        let mut state = self.shared.states.rent();
        let mut buf = match self.shared.buffers.rent(HEADER_SIZE + src.len()) {
            Ok(buf) => buf,
            Err(err) => {
                self.shared.states.give_back(state);
                resolve(sink, Err(err));
                return handle;
            }
        };
        buf.extend_from_slice(&Header::new(src.len() as u32).encode());
        buf.extend_from_slice(src);

        state.begin(
            OperationKind::Send,
            UserToken::Write {
                sink,
                total_written: 0,
            },
            endpoint,
        );
        state.buffer = Some(buf);

        let shared = self.shared.clone();
        let payload_len = src.len();
        tokio::spawn(async move {
            let outcome = send_frame(&shared, &mut state, &cancel).await;

            let token = state.take_token();
            if let Some(buf) = state.take_buffer() {
                shared.buffers.give_back(buf, false);
            }
            shared.states.give_back(state);

            if let Some(UserToken::Write { sink, .. }) = token {
                resolve(sink, outcome.map(|()| payload_len));
            }
        });

        handle
    }

    /// Receive one frame, blocking until its full payload has arrived,
    /// and copy the payload into `dst`.
    ///
    /// Fails with [`FramewireError::BufferTooLarge`] when the frame
    /// payload does not fit in `dst`; a shorter payload returns its own
    /// length. Frames are never split or merged across calls.
    pub async fn read(&self, endpoint: SocketAddr, dst: &mut [u8]) -> Result<TransmissionResult> {
        let result = self.read_async(endpoint, dst.len()).wait().await?;
        if result.buffer_view.len() > dst.len() {
            return Err(FramewireError::BufferTooLarge {
                len: result.buffer_view.len(),
                max: dst.len(),
            });
        }
        dst[..result.buffer_view.len()].copy_from_slice(&result.buffer_view);
        Ok(result)
    }

    /// Initiate a framed receive; resolves with the received payload.
    ///
    /// `expected_len` is the caller's expected payload size, used only to
    /// size the continuation; the frame's own header decides how many
    /// bytes are read.
    pub fn read_async(
        &self,
        endpoint: SocketAddr,
        expected_len: usize,
    ) -> CompletionHandle<TransmissionResult> {
        let (handle, sink, cancel) = CompletionHandle::new();

        if expected_len > self.shared.max_message_size {
            resolve(
                sink,
                Err(FramewireError::BufferTooLarge {
                    len: expected_len,
                    max: self.shared.max_message_size,
                }),
            );
            return handle;
        }
        if self.shared.shutdown.is_signalled() {
            resolve(sink, Err(FramewireError::Shutdown));
            return handle;
        }
        self.debug_assert_peer(endpoint);

        let mut state = self.shared.states.rent();
        let buf = match self
            .shared
            .buffers
            .rent(HEADER_SIZE + self.shared.max_message_size)
        {
            Ok(buf) => buf,
            Err(err) => {
                self.shared.states.give_back(state);
                resolve(sink, Err(err));
                return handle;
            }
        };

        state.begin(
            OperationKind::Receive,
            UserToken::Read {
                sink,
                total_read: 0,
            },
            endpoint,
        );
        state.buffer = Some(buf);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = recv_frame(&shared, &mut state, &cancel).await;

            let payload = outcome.map(|payload_len| {
                let buf = state.buffer.as_ref().expect("receive kept its buffer");
                TransmissionResult {
                    bytes_transferred: payload_len,
                    peer: state.endpoint,
                    buffer_view: Bytes::copy_from_slice(
                        &buf[HEADER_SIZE..HEADER_SIZE + payload_len],
                    ),
                }
            });

            let token = state.take_token();
            if let Some(buf) = state.take_buffer() {
                shared.buffers.give_back(buf, false);
            }
            shared.states.give_back(state);

            if let Some(UserToken::Read { sink, .. }) = token {
                resolve(sink, payload);
            }
        });

        handle
    }

    /// Shut down one or both directions of the connected socket.
    pub async fn shutdown(&self, how: std::net::Shutdown) -> Result<()> {
        use std::net::Shutdown;

        if matches!(how, Shutdown::Write | Shutdown::Both) {
            let mut guard = self.shared.write_half.lock().await;
            if let Some(write_half) = guard.as_mut() {
                write_half.shutdown().await.map_err(map_io_error)?;
            }
        }
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            self.shared.read_half.lock().await.take();
        }
        Ok(())
    }

    /// Tear the writer down: signal shutdown, close the socket, drop the
    /// idle pool contents. In-flight operations observe the signal and
    /// resolve `Cancelled` or `Shutdown`.
    pub async fn dispose(&self) {
        self.shared.shutdown.signal();
        self.shared.socket.lock().take();
        self.shared.read_half.lock().await.take();
        if let Some(mut write_half) = self.shared.write_half.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        *self.shared.peer.lock() = None;
        self.shared.states.dispose();
    }

    fn debug_assert_peer(&self, endpoint: SocketAddr) {
        // TCP ignores the per-call endpoint after connect; the argument is
        // kept for a future connectionless transport.
        if let Some(peer) = self.peer_addr() {
            debug_assert_eq!(endpoint, peer, "endpoint argument does not match peer");
        }
        let _ = endpoint;
    }
}

fn not_connected() -> FramewireError {
    FramewireError::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "writer is not connected",
    ))
}

async fn do_connect(
    shared: &WriterShared,
    endpoint: SocketAddr,
    cancel: &CancelToken,
) -> Result<()> {
    if shared.shutdown.is_signalled() {
        return Err(FramewireError::Shutdown);
    }
    if cancel.is_cancelled() {
        return Err(FramewireError::Cancelled);
    }

    let socket = shared
        .socket
        .lock()
        .take()
        .ok_or(FramewireError::InvalidConfig(
            "socket is already connected or disposed",
        ))?;

    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(FramewireError::Cancelled),
        result = socket.connect(endpoint) => result.map_err(map_io_error)?,
    };
    let peer = stream.peer_addr().map_err(map_io_error)?;

    let (read_half, write_half) = stream.into_split();
    *shared.read_half.lock().await = Some(read_half);
    *shared.write_half.lock().await = Some(write_half);
    *shared.peer.lock() = Some(peer);

    Ok(())
}

async fn do_disconnect(
    shared: &WriterShared,
    reuse_socket: bool,
    cancel: &CancelToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(FramewireError::Cancelled);
    }

    let write_half = shared.write_half.lock().await.take();
    let read_half = shared.read_half.lock().await.take();
    *shared.peer.lock() = None;

    let mut write_half = match write_half {
        Some(write_half) => write_half,
        None => return Err(not_connected()),
    };
    drop(read_half);

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(FramewireError::Cancelled),
        result = write_half.shutdown() => result.map_err(map_io_error),
    };

    if reuse_socket {
        let socket = if shared.default_endpoint.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(map_io_error)?;
        *shared.socket.lock() = Some(socket);
    }

    outcome
}

/// Push the state object's framed buffer through the socket, spanning as
/// many OS sends as needed.
async fn send_frame(
    shared: &WriterShared,
    state: &mut TransferState,
    cancel: &CancelToken,
) -> Result<()> {
    let mut guard = shared.write_half.lock().await;
    let stream = guard.as_mut().ok_or_else(not_connected)?;

    let total = state.buffer.as_ref().map(|b| b.len()).unwrap_or(0);
    let mut inline = InlineGuard::new();

    while state.bytes_transferred < total {
        if shared.shutdown.is_signalled() {
            return Err(FramewireError::Shutdown);
        }
        if cancel.is_cancelled() {
            return Err(FramewireError::Cancelled);
        }

        let written = {
            let buf = state.buffer.as_ref().expect("send owns its buffer");
            let remaining = &buf[state.bytes_transferred..];
            tokio::select! {
                _ = cancel.cancelled() => return Err(FramewireError::Cancelled),
                _ = shared.shutdown.signalled() => return Err(FramewireError::Shutdown),
                result = stream.write(remaining) => result.map_err(map_io_error)?,
            }
        };
        if written == 0 {
            return Err(FramewireError::PeerClosed);
        }

        state.bytes_transferred += written;
        if let Some(UserToken::Write { total_written, .. }) = state.token.as_mut() {
            *total_written += written;
        }
        inline.tick().await;
    }

    Ok(())
}

/// Pull one frame from the socket into the state object's buffer: the
/// header first, then exactly the declared payload. Returns the payload
/// length.
async fn recv_frame(
    shared: &WriterShared,
    state: &mut TransferState,
    cancel: &CancelToken,
) -> Result<usize> {
    let mut guard = shared.read_half.lock().await;
    let stream = guard.as_mut().ok_or_else(not_connected)?;

    let mut inline = InlineGuard::new();

    // Header phase.
    state
        .buffer
        .as_mut()
        .expect("receive owns its buffer")
        .resize(HEADER_SIZE, 0);
    while state.bytes_transferred < HEADER_SIZE {
        let read = recv_step(stream, state, cancel, &shared.shutdown, HEADER_SIZE).await?;
        state.bytes_transferred += read;
        if let Some(UserToken::Read { total_read, .. }) = state.token.as_mut() {
            *total_read += read;
        }
        inline.tick().await;
    }

    let header = {
        let buf = state.buffer.as_ref().expect("receive owns its buffer");
        Header::decode(&buf[..HEADER_SIZE], shared.max_message_size)?
    };
    let total = header.total_frame_size();

    // Payload phase: reslice the same buffer out to the full frame.
    state
        .buffer
        .as_mut()
        .expect("receive owns its buffer")
        .resize(total, 0);
    while state.bytes_transferred < total {
        let read = recv_step(stream, state, cancel, &shared.shutdown, total).await?;
        state.bytes_transferred += read;
        if let Some(UserToken::Read { total_read, .. }) = state.token.as_mut() {
            *total_read += read;
        }
        inline.tick().await;
    }

    Ok(header.payload_length as usize)
}

/// One partial receive into the state's buffer, bounded by `target`.
async fn recv_step(
    stream: &mut OwnedReadHalf,
    state: &mut TransferState,
    cancel: &CancelToken,
    shutdown: &ShutdownSignal,
    target: usize,
) -> Result<usize> {
    if shutdown.is_signalled() {
        return Err(FramewireError::Shutdown);
    }
    if cancel.is_cancelled() {
        return Err(FramewireError::Cancelled);
    }

    let buf = state.buffer.as_mut().expect("receive owns its buffer");
    let slice = &mut buf[state.bytes_transferred..target];
    let read = tokio::select! {
        _ = cancel.cancelled() => return Err(FramewireError::Cancelled),
        _ = shutdown.signalled() => return Err(FramewireError::Shutdown),
        result = stream.read(slice) => result.map_err(map_io_error)?,
    };
    if read == 0 {
        return Err(FramewireError::PeerClosed);
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn any_endpoint() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn new_writer(max_message_size: usize) -> StreamWriter {
        let socket = TcpSocket::new_v4().unwrap();
        StreamWriter::new(socket, any_endpoint(), max_message_size, 8, 4).unwrap()
    }

    #[tokio::test]
    async fn test_zero_max_message_size_rejected() {
        let socket = TcpSocket::new_v4().unwrap();
        let result = StreamWriter::new(socket, any_endpoint(), 0, 8, 4);
        assert!(matches!(result, Err(FramewireError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_max_message_size_above_ceiling_rejected() {
        let socket = TcpSocket::new_v4().unwrap();
        let result = StreamWriter::new(
            socket,
            any_endpoint(),
            ABSOLUTE_MAX_PAYLOAD_SIZE + 1,
            8,
            4,
        );
        assert!(matches!(result, Err(FramewireError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_write_larger_than_max_rejected() {
        let writer = new_writer(16);
        let err = writer
            .write(any_endpoint(), &[0u8; 17])
            .await
            .expect_err("oversized write must fail");
        assert!(matches!(err, FramewireError::BufferTooLarge { len: 17, max: 16 }));
    }

    #[tokio::test]
    async fn test_write_without_connect_fails() {
        let writer = new_writer(1024);
        let err = writer
            .write(any_endpoint(), b"hello")
            .await
            .expect_err("write on unconnected writer must fail");
        assert!(matches!(err, FramewireError::Transport(_)));
    }

    #[tokio::test]
    async fn test_connect_write_read_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Raw peer: echo one frame verbatim.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes(header) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.unwrap();
            stream.write_all(&header).await.unwrap();
            stream.write_all(&payload).await.unwrap();
        });

        let writer = new_writer(1024);
        writer.connect(addr).await.unwrap();
        assert_eq!(writer.peer_addr(), Some(addr));

        let sent = writer.write(addr, b"ping").await.unwrap();
        assert_eq!(sent.bytes_transferred, 4);
        assert_eq!(&sent.buffer_view[..], b"ping");

        let mut dst = [0u8; 4];
        let received = writer.read(addr, &mut dst).await.unwrap();
        assert_eq!(received.bytes_transferred, 4);
        assert_eq!(&dst, b"ping");

        server.await.unwrap();
        writer.disconnect(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_smaller_dst_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame_len = 8u32.to_le_bytes();
            stream.write_all(&frame_len).await.unwrap();
            stream.write_all(&[0x55; 8]).await.unwrap();
            // Hold the socket open until the client is done.
            let mut scratch = [0u8; 1];
            let _ = stream.read(&mut scratch).await;
        });

        let writer = new_writer(1024);
        writer.connect(addr).await.unwrap();

        let mut dst = [0u8; 4];
        let err = writer
            .read(addr, &mut dst)
            .await
            .expect_err("payload larger than dst must fail");
        assert!(matches!(err, FramewireError::BufferTooLarge { len: 8, max: 4 }));

        writer.dispose().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_with_reuse_allows_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // Two sequential connections.
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut scratch = [0u8; 1];
                let _ = stream.read(&mut scratch).await;
            }
        });

        let writer = new_writer(1024);
        writer.connect(addr).await.unwrap();
        writer.disconnect(true).await.unwrap();
        assert_eq!(writer.peer_addr(), None);

        writer.connect(addr).await.unwrap();
        assert_eq!(writer.peer_addr(), Some(addr));

        writer.dispose().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_dispose_fail_with_shutdown() {
        let writer = new_writer(1024);
        writer.dispose().await;

        let err = writer
            .write_async(any_endpoint(), b"x")
            .wait()
            .await
            .expect_err("write after dispose must fail");
        assert!(matches!(err, FramewireError::Shutdown));
    }
}
