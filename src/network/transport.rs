//! Raw duplex byte streams to the backend.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Any bidirectional byte stream the engine can frame messages over
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;
pub type FrameReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split a stream so the receive loop and the send path own separate halves
pub fn split_stream(stream: BoxedStream) -> (FrameReader, FrameWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Opens the underlying channel for a connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> std::io::Result<BoxedStream>;
}

/// TCP loopback connector
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, endpoint: &str) -> std::io::Result<BoxedStream> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %endpoint, local = ?stream.local_addr().ok(), "TCP channel opened");
        Ok(Box::new(stream))
    }
}
