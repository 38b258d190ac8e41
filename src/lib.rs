//! # framewire
//!
//! Asynchronous, low-level TCP networking with two concrete endpoints: a
//! [`StreamReader`] (server-side acceptor serving framed request/response
//! exchanges from many concurrent peers) and a [`StreamWriter`]
//! (client-side bidirectional messenger).
//!
//! ## Architecture
//!
//! - **Framed transport**: every message is a 4-byte little-endian length
//!   header followed by the payload, with partial-read/partial-write
//!   continuation on both sides.
//! - **Completion engine**: each connection runs
//!   `accept → receive header → receive body → invoke handler →
//!   send response → receive header …`, tolerating OS-level short
//!   reads and writes.
//! - **Pooling**: completion state objects and transmission buffers are
//!   rented per operation instead of allocated per frame.
//!
//! ## Example
//!
//! ```ignore
//! use framewire::{StreamReader, StreamWriter};
//! use tokio::net::{TcpListener, TcpSocket};
//!
//! #[tokio::main]
//! async fn main() -> framewire::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:12377").await?;
//!     let echo = |_peer, request: &[u8], response: &mut bytes::BytesMut| {
//!         response.extend_from_slice(request);
//!         true
//!     };
//!     let reader = StreamReader::new(
//!         listener, echo, "127.0.0.1:12377".parse().unwrap(), 8192, 64, 32,
//!     )?;
//!     reader.start(8)?;
//!
//!     let addr = reader.local_addr()?;
//!     let writer = StreamWriter::new(
//!         TcpSocket::new_v4()?, addr, 8192, 64, 32,
//!     )?;
//!     writer.connect(addr).await?;
//!     writer.write(addr, b"hello").await?;
//!
//!     let mut reply = [0u8; 5];
//!     writer.read(addr, &mut reply).await?;
//!     assert_eq!(&reply, b"hello");
//!
//!     reader.stop().await;
//!     Ok(())
//! }
//! ```

pub mod pool;
pub mod protocol;

mod completion;
mod error;
mod handler;
mod reader;
mod shutdown;
mod transfer;
mod writer;

pub use completion::{CancelToken, CompletionHandle, CompletionSink};
pub use error::{FramewireError, Result};
pub use handler::RequestHandler;
pub use reader::StreamReader;
pub use shutdown::ShutdownSignal;
pub use transfer::{OperationKind, TransferState, TransmissionResult, UserToken};
pub use writer::StreamWriter;
