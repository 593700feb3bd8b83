//! Broker integration test module
//!
//! Runs the real gRPC endpoint on an ephemeral localhost port.
//!
//! - `e2e_dispatch`: client → broker → worker → client round trips
//! - `e2e_liveness`: heartbeats, eviction and shutdown

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use muf_broker::{Broker, BrokerStatus};
use muf_core::session::{request_type, SessionMessage};
use muf_core::{AppContext, Frame, MufConfig, Multipart, RequestHandler, Result};

mod e2e_dispatch;
mod e2e_liveness;

pub const WAIT: Duration = Duration::from_secs(10);

pub struct TestBroker {
    pub addr: SocketAddr,
    pub ctx: AppContext,
    pub status: watch::Receiver<BrokerStatus>,
    pub handle: JoinHandle<muf_broker::Result<()>>,
}

/// Start a broker on 127.0.0.1:0 with the given heartbeat settings.
pub async fn start_test_broker(heartbeat_interval_ms: u64, liveness: u32) -> TestBroker {
    let mut config = MufConfig::default();
    config.broker.heartbeat_interval_ms = heartbeat_interval_ms;
    config.broker.heartbeat_liveness = liveness;
    let ctx = AppContext::new(config);
    let broker = Broker::bind(&ctx, "127.0.0.1:0")
        .await
        .expect("bind test broker");
    let addr = broker.local_addr();
    let status = broker.status();
    let handle = tokio::spawn(broker.run());
    TestBroker {
        addr,
        ctx,
        status,
        handle,
    }
}

impl TestBroker {
    pub async fn wait_status(&mut self, pred: impl FnMut(&BrokerStatus) -> bool) -> BrokerStatus {
        timeout(WAIT, self.status.wait_for(pred))
            .await
            .expect("status within timeout")
            .expect("broker alive")
            .clone()
    }
}

/// Worker-side context pointing at the test broker.
pub fn worker_context(addr: SocketAddr) -> AppContext {
    let mut config = MufConfig::default();
    config.worker.broker_address = addr.to_string();
    config.worker.reconnect_delay_ms = 100;
    config.client.server_address = addr.to_string();
    config.client.client_address = addr.to_string();
    AppContext::new(config)
}

/// Minimal session manager: accepts every connect on the same endpoint.
pub struct SessionManager;

#[async_trait]
impl RequestHandler for SessionManager {
    async fn handle(&self, _client: &Frame, body: Multipart) -> Result<Multipart> {
        let payload = body.back().map(|f| f.to_string_lossy()).unwrap_or_default();
        let request = SessionMessage::from_json(&payload)?;
        let reply = match request.request_type.as_str() {
            request_type::REQUEST_CONNECT => {
                SessionMessage::new(request_type::SESSION_INITIATED, &request.session_id)
            }
            request_type::REQUEST_DISCONNECT => {
                SessionMessage::new(request_type::SESSION_CLOSED, &request.session_id)
            }
            _ => SessionMessage::new(
                request_type::RESPONSE_NOT_VALID_OPERATION,
                &request.session_id,
            ),
        };
        Ok(Multipart::new().with(reply.to_json()?))
    }
}

/// Answers every request with the same payload.
pub struct Fixed(pub &'static str);

#[async_trait]
impl RequestHandler for Fixed {
    async fn handle(&self, _client: &Frame, _body: Multipart) -> Result<Multipart> {
        Ok(Multipart::new().with(self.0))
    }
}

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
