//! In-memory transport and helpers shared by the client and worker tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use muf_core::protocol::{self, Inbound};
use muf_core::session::{request_type, SessionMessage};
use muf_core::{
    AppContext, ClientCommController, ClientCommControllerBuilder, Connection, ConnectionEvent,
    Connector, FrameSink, FrameStream, MufConfig, MufError, Multipart, Result,
};

pub const SERVER: &str = "mem://server";
pub const CLIENT: &str = "mem://client";
pub const SESSION_MANAGER: &str = "session-manager";
pub const WAIT: Duration = Duration::from_secs(5);

/// Connector whose connections end in the test instead of a broker.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerSide>,
    refuse: AtomicBool,
}

/// Test-held end of one in-memory connection.
pub struct ServerSide {
    pub address: String,
    pub inbound: mpsc::Receiver<Multipart>,
    pub outbound: mpsc::Sender<Multipart>,
}

pub struct Acceptor {
    rx: mpsc::UnboundedReceiver<ServerSide>,
}

pub fn memory_connector() -> (Arc<MemoryConnector>, Acceptor) {
    let (accepted, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MemoryConnector {
            accepted,
            refuse: AtomicBool::new(false),
        }),
        Acceptor { rx },
    )
}

impl MemoryConnector {
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Connection> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(MufError::Transport(format!("connection refused: {address}")));
        }
        let (to_server, inbound) = mpsc::channel(1_024);
        let (outbound, from_server) = mpsc::channel(1_024);
        self.accepted
            .send(ServerSide {
                address: address.to_string(),
                inbound,
                outbound,
            })
            .map_err(|_| MufError::TransportInterrupted)?;
        Ok(Connection {
            sink: Box::new(MemorySink { tx: to_server }),
            stream: Box::new(MemoryStream { rx: from_server }),
        })
    }
}

struct MemorySink {
    tx: mpsc::Sender<Multipart>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, msg: Multipart) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| MufError::TransportInterrupted)
    }
}

struct MemoryStream {
    rx: mpsc::Receiver<Multipart>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Multipart>> {
        Ok(self.rx.recv().await)
    }
}

impl Acceptor {
    pub async fn accept(&mut self) -> ServerSide {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("connection within timeout")
            .expect("connector alive")
    }

    pub async fn assert_no_connection(&mut self, within: Duration) {
        assert!(
            timeout(within, self.rx.recv()).await.is_err(),
            "unexpected connection attempt"
        );
    }
}

impl ServerSide {
    /// Next message, or `None` once the client dropped its send half.
    pub async fn recv(&mut self) -> Option<Multipart> {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("message within timeout")
    }

    /// Next client message as `(service, payload)`.
    pub async fn expect_client_message(&mut self) -> (String, String) {
        let frames = self.recv().await.expect("client message");
        match protocol::parse_inbound(frames).expect("valid client frames") {
            Inbound::Client { service, body } => (
                service.to_string_lossy(),
                body.back().map(|f| f.to_string_lossy()).unwrap_or_default(),
            ),
            other => panic!("expected client message, got {other:?}"),
        }
    }

    pub async fn expect_connect(&mut self) -> SessionMessage {
        let (service, payload) = self.expect_client_message().await;
        assert_eq!(service, SESSION_MANAGER);
        SessionMessage::from_json(&payload).expect("session message json")
    }

    pub async fn reply(&self, service: &str, payload: &str) {
        self.outbound
            .send(protocol::client_message(service, Multipart::new().with(payload)))
            .await
            .expect("client receive half alive");
    }

    /// Answers a connect request with SESSION_INITIATED naming `session_address`.
    pub async fn initiate(&self, request: &SessionMessage, session_address: &str) {
        let reply = SessionMessage::new(request_type::SESSION_INITIATED, &request.session_id)
            .with_payload(session_address);
        self.reply(SESSION_MANAGER, &reply.to_json().unwrap()).await;
    }

    /// Reads the connect request and accepts it on this connection.
    pub async fn handshake(&mut self) -> SessionMessage {
        let request = self.expect_connect().await;
        self.initiate(&request, "").await;
        request
    }
}

pub fn context(backpressure_threshold: u64, handshake_timeout_ms: u64) -> AppContext {
    let mut config = MufConfig::default();
    config.client.backpressure_threshold = backpressure_threshold;
    config.client.handshake_timeout_ms = handshake_timeout_ms;
    config.client.session_manager_service = SESSION_MANAGER.to_string();
    AppContext::new(config)
}

pub fn builder(connector: &Arc<MemoryConnector>) -> ClientCommControllerBuilder {
    ClientCommController::builder()
        .service_name("client-1")
        .server_address(SERVER)
        .client_address(CLIENT)
        .connector(connector.clone())
}

/// Listener that forwards every delivered payload to a channel.
pub fn collecting_listener() -> (
    impl Fn(String) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |message: String| {
            let _ = tx.send(message);
        },
        rx,
    )
}

pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(WAIT, rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("listener alive")
}

pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    matches: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("event within timeout")
}
