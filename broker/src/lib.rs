//! Majordomo-style broker: one gRPC endpoint, a mediator owning the
//! service and worker registries, and the loop that drives both.

pub mod mediator;
pub mod router;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muf_core::AppContext;
use muf_proto::FrameRouterServer;

pub use mediator::{BrokerStatus, Mediator, Outbound, ServiceStatus};
pub use router::RouterService;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("router task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// `tcp://*:5555` and `*:5555` listen on every interface.
fn listen_address(address: &str) -> String {
    let address = address.trim();
    let address = address.strip_prefix("tcp://").unwrap_or(address);
    match address.strip_prefix("*:") {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    }
}

pub struct Broker {
    ctx: AppContext,
    listener: TcpListener,
    local_addr: SocketAddr,
    status: watch::Sender<BrokerStatus>,
}

impl Broker {
    /// Binds the endpoint. Port 0 picks an ephemeral port.
    pub async fn bind(ctx: &AppContext, address: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_address(address)).await?;
        let local_addr = listener.local_addr()?;
        info!(target: "broker", %local_addr, "Broker endpoint bound");
        let (status, _) = watch::channel(BrokerStatus::default());
        Ok(Self {
            ctx: ctx.clone(),
            listener,
            local_addr,
            status,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry snapshot, refreshed after every loop iteration.
    pub fn status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.subscribe()
    }

    /// Serves until the context shuts down or the transport fails, then
    /// disconnects every worker.
    pub async fn run(self) -> Result<()> {
        let config = self.ctx.config().broker.clone();
        let interval = config.heartbeat_interval();
        let (inbound_tx, mut inbound) = mpsc::channel(config.inbound_capacity.max(1));
        let router = RouterService::new(inbound_tx, config.peer_capacity);

        let server_stop = CancellationToken::new();
        let stop = server_stop.clone();
        let incoming = TcpListenerStream::new(self.listener);
        let mut server = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(FrameRouterServer::new(router.clone()))
                .serve_with_incoming_shutdown(incoming, async move { stop.cancelled().await }),
        );

        let shutdown = self.ctx.shutdown_token();
        let mut mediator = Mediator::new(interval, config.heartbeat_expiry(), Instant::now());
        info!(
            target: "broker",
            addr = %self.local_addr,
            heartbeat_ms = interval.as_millis() as u64,
            liveness = config.heartbeat_liveness,
            "Broker running"
        );

        let mut server_result = None;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = &mut server => {
                    warn!(target: "broker", "Transport endpoint stopped; shutting down");
                    server_result = Some(res);
                    break;
                }
                next = timeout(interval, inbound.recv()) => next,
            };
            match next {
                Ok(Some((sender, frames))) => {
                    if let Err(err) = mediator.handle(sender, frames, Instant::now()) {
                        self.ctx.errors().handle("broker.mediator", &err);
                    }
                }
                Ok(None) => break,
                // poll timeout; fall through to the sweep
                Err(_) => {}
            }
            let now = Instant::now();
            mediator.purge_workers(now);
            mediator.send_heartbeats(now);
            flush(&router, &mut mediator);
            let status = mediator.status();
            debug!(target: "broker", ?status, "Sweep");
            self.status.send_replace(status);
        }

        mediator.disconnect_all();
        flush(&router, &mut mediator);
        self.status.send_replace(mediator.status());
        router.close_all();
        server_stop.cancel();

        let res = match server_result {
            Some(res) => res,
            None => match timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(target: "broker", "Peers did not drain in time; aborting endpoint");
                    server.abort();
                    return Ok(());
                }
            },
        };
        info!(target: "broker", "Broker stopped");
        res?.map_err(BrokerError::from)
    }
}

fn flush(router: &RouterService, mediator: &mut Mediator) {
    for Outbound { to, frames } in mediator.drain_outbox() {
        router.send(&to, frames);
    }
}
