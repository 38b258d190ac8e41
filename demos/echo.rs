//! Minimal echo server and client on loopback.
//!
//! Run with: `cargo run --example echo`

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpSocket};

use framewire::{StreamReader, StreamWriter};

#[tokio::main]
async fn main() -> framewire::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let default_endpoint: SocketAddr = "127.0.0.1:12377".parse().unwrap();

    let echo = |peer: SocketAddr, request: &[u8], response: &mut BytesMut| {
        tracing::info!("echoing {} bytes back to {peer}", request.len());
        response.extend_from_slice(request);
        true
    };

    let listener = TcpListener::bind(default_endpoint).await?;
    let reader = StreamReader::new(listener, echo, default_endpoint, 8192, 64, 32)?;
    let addr = reader.local_addr()?;
    reader.start(8)?;
    tracing::info!("echo reader listening on {addr}");

    let writer = StreamWriter::new(TcpSocket::new_v4()?, addr, 8192, 64, 32)?;
    writer.connect(addr).await?;

    let payload = b"hello over framewire";
    writer.write(addr, payload).await?;

    let mut reply = vec![0u8; payload.len()];
    let received = writer.read(addr, &mut reply).await?;
    tracing::info!(
        "received {} bytes back: {:?}",
        received.bytes_transferred,
        String::from_utf8_lossy(&reply)
    );

    writer.disconnect(false).await?;
    reader.stop().await;
    Ok(())
}
