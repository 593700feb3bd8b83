// MUF Core Library
// Communication runtime for multi-session orchestration: frames, protocol,
// transport, client connection manager and worker sessions.

pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod frame;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod worker;

// Export core types
pub use client::{
    ClientCommController, ClientCommControllerBuilder, ConnectionEvent, ConnectionState,
    ResponseListener,
};
pub use config::{BrokerConfig, ClientConfig, ErrorPolicy, MufConfig, WorkerConfig};
pub use context::{AppContext, ErrorHandler};
pub use envelope::Envelope;
pub use frame::{Frame, Multipart};
pub use session::SessionMessage;
pub use transport::{Connection, Connector, FrameSink, FrameStream, GrpcConnector};
pub use worker::{RequestHandler, WorkerHandle, WorkerSession};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MufError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport interrupted")]
    TransportInterrupted,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No response from server {address} within {timeout_ms} ms")]
    HandshakeTimeout { address: String, timeout_ms: u64 },

    #[error("Connect rejected by session manager: {0}")]
    ConnectRejected(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Controller closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MufError {
    /// Recoverable failures are handled locally (disconnect, reconnect,
    /// failed connect) and never escalate through the error policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MufError::Transport(_)
                | MufError::TransportInterrupted
                | MufError::ProtocolViolation(_)
                | MufError::HandshakeTimeout { .. }
                | MufError::ConnectRejected(_)
                | MufError::Closed
        )
    }
}

impl From<tonic::Status> for MufError {
    fn from(status: tonic::Status) -> Self {
        MufError::Transport(status.to_string())
    }
}

impl From<tonic::transport::Error> for MufError {
    fn from(err: tonic::transport::Error) -> Self {
        MufError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MufError>;
