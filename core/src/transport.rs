//! Bidirectional message transport used by clients and workers.
//!
//! A `Connection` is split into a send half and a receive half so that two
//! tasks can own one half each without sharing.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use muf_proto::FrameRouterClient;

use crate::frame::Multipart;
use crate::{MufError, Result};

/// Send half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, msg: Multipart) -> Result<()>;
}

/// Receive half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// `Ok(None)` means the peer closed the stream.
    async fn recv(&mut self) -> Result<Option<Multipart>>;
}

pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens connections to a broker endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Connection>;
}

/// Normalizes `host:port`, `tcp://host:port` and `http(s)://host:port`
/// into a URI the gRPC client accepts. A `*` host means localhost.
pub fn endpoint_uri(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.to_string();
    }
    let hostport = address.strip_prefix("tcp://").unwrap_or(address);
    let hostport = match hostport.strip_prefix("*:") {
        Some(port) => format!("127.0.0.1:{port}"),
        None => hostport.to_string(),
    };
    format!("http://{hostport}")
}

/// Connector over the `FrameRouter` gRPC service.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    buffer: usize,
}

impl GrpcConnector {
    pub fn new(buffer: usize) -> Self {
        Self { buffer }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, address: &str) -> Result<Connection> {
        let uri = endpoint_uri(address);
        debug!(target: "transport", %uri, "Opening frame stream");
        let mut client = FrameRouterClient::connect(uri).await?;
        let (tx, rx) = mpsc::channel::<muf_proto::Multipart>(self.buffer);
        let inbound = client.open(ReceiverStream::new(rx)).await?.into_inner();
        Ok(Connection {
            sink: Box::new(GrpcSink { tx }),
            stream: Box::new(GrpcStream { inbound }),
        })
    }
}

struct GrpcSink {
    tx: mpsc::Sender<muf_proto::Multipart>,
}

#[async_trait]
impl FrameSink for GrpcSink {
    async fn send(&mut self, msg: Multipart) -> Result<()> {
        self.tx
            .send(msg.into())
            .await
            .map_err(|_| MufError::TransportInterrupted)
    }
}

struct GrpcStream {
    inbound: tonic::Streaming<muf_proto::Multipart>,
}

#[async_trait]
impl FrameStream for GrpcStream {
    async fn recv(&mut self) -> Result<Option<Multipart>> {
        match self.inbound.message().await {
            Ok(Some(msg)) => Ok(Some(msg.into())),
            Ok(None) => Ok(None),
            Err(status) => Err(status.into()),
        }
    }
}
