//! Worker side of the broker protocol.
//!
//! A `WorkerSession` registers one service with the broker and answers
//! requests one at a time through a `RequestHandler`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::context::AppContext;
use crate::envelope::Envelope;
use crate::frame::{Frame, Multipart};
use crate::protocol::{self, BrokerCommand};
use crate::transport::{Connection, Connector, FrameSink, FrameStream, GrpcConnector};
use crate::{MufError, Result};

/// Processes one request body and produces the reply body.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `client` is the routing identity of the requesting client.
    async fn handle(&self, client: &Frame, body: Multipart) -> Result<Multipart>;
}

enum Control {
    Shutdown { client: Frame, body: Multipart },
}

pub struct WorkerSession {
    ctx: AppContext,
    service: String,
    config: WorkerConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn RequestHandler>,
}

/// Handle to a running worker.
pub struct WorkerHandle {
    stop: CancellationToken,
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

/// Why one broker connection ended.
enum Exit {
    Stopped,
    Reconnect,
}

impl WorkerSession {
    pub fn new(
        ctx: &AppContext,
        service: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            service: service.into(),
            config: ctx.config().worker.clone(),
            connector: Arc::new(GrpcConnector::default()),
            handler: Arc::new(handler),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_broker_address(mut self, address: impl Into<String>) -> Self {
        self.config.broker_address = address.into();
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Runs the worker on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let stop = self.ctx.shutdown_token().child_token();
        let (control, control_rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(stop.clone(), control_rx));
        WorkerHandle {
            stop,
            control,
            task,
        }
    }

    async fn run(self, stop: CancellationToken, mut control: mpsc::Receiver<Control>) {
        info!(target: "worker", service = %self.service, broker = %self.config.broker_address, "Worker starting");
        loop {
            let exit = match self.connect(&stop).await {
                Ok(Some(Connection { mut sink, mut stream })) => {
                    match self
                        .serve(&stop, &mut control, sink.as_mut(), stream.as_mut())
                        .await
                    {
                        Ok(exit) => exit,
                        Err(err) => {
                            self.ctx.errors().handle("worker", &err);
                            Exit::Reconnect
                        }
                    }
                }
                Ok(None) => Exit::Stopped,
                Err(err) => {
                    self.ctx.errors().handle("worker.connect", &err);
                    Exit::Reconnect
                }
            };
            if matches!(exit, Exit::Stopped) {
                break;
            }
            debug!(target: "worker", service = %self.service, delay_ms = self.config.reconnect_delay_ms, "Reconnecting to broker");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }
        info!(target: "worker", service = %self.service, "Worker stopped");
    }

    async fn connect(&self, stop: &CancellationToken) -> Result<Option<Connection>> {
        tokio::select! {
            _ = stop.cancelled() => Ok(None),
            conn = self.connector.connect(&self.config.broker_address) => conn.map(Some),
        }
    }

    async fn serve(
        &self,
        stop: &CancellationToken,
        control: &mut mpsc::Receiver<Control>,
        sink: &mut dyn FrameSink,
        stream: &mut dyn FrameStream,
    ) -> Result<Exit> {
        sink.send(protocol::ready(&self.service)).await?;
        debug!(target: "worker", service = %self.service, "READY sent");

        let interval = self.config.heartbeat_interval();
        let mut liveness = self.config.heartbeat_liveness;
        let mut heartbeat_at = Instant::now() + interval;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let _ = sink.send(protocol::disconnect()).await;
                    return Ok(Exit::Stopped);
                }
                Some(Control::Shutdown { client, body }) = control.recv() => {
                    let envelope = Envelope::new(body).wrap(client);
                    sink.send(protocol::shutdown(&envelope, Some(&self.service))).await?;
                }
                next = timeout(interval, stream.recv()) => match next {
                    Ok(Ok(Some(frames))) => {
                        liveness = self.config.heartbeat_liveness;
                        match protocol::parse_broker_command(frames) {
                            Ok(BrokerCommand::Request(envelope)) => {
                                self.answer(sink, envelope).await?;
                            }
                            Ok(BrokerCommand::Heartbeat) => {}
                            Ok(BrokerCommand::Disconnect) => {
                                info!(target: "worker", service = %self.service, "Broker requested disconnect");
                                return Ok(Exit::Reconnect);
                            }
                            Err(err) => warn!(target: "worker", error = %err, "Invalid message from broker"),
                        }
                    }
                    Ok(Ok(None)) => return Err(MufError::TransportInterrupted),
                    Ok(Err(err)) => return Err(err),
                    Err(_) => {
                        liveness = liveness.saturating_sub(1);
                        if liveness == 0 {
                            warn!(target: "worker", service = %self.service, "Broker unresponsive");
                            return Ok(Exit::Reconnect);
                        }
                    }
                },
            }
            if Instant::now() >= heartbeat_at {
                sink.send(protocol::heartbeat()).await?;
                heartbeat_at = Instant::now() + interval;
            }
        }
    }

    #[instrument(skip_all, fields(service = %self.service))]
    async fn answer(&self, sink: &mut dyn FrameSink, envelope: Envelope) -> Result<()> {
        let Some(client) = envelope.address().cloned() else {
            return Err(MufError::ProtocolViolation("REQUEST without client address".into()));
        };
        let body = envelope.body().clone();
        match self.handler.handle(&client, body).await {
            Ok(reply) => sink.send(protocol::reply(&envelope.with_body(reply))).await,
            Err(err) => {
                // the client gets no reply; the worker stays available
                self.ctx.errors().handle("worker.handler", &err);
                Ok(())
            }
        }
    }
}

impl WorkerHandle {
    /// Sends a SHUTDOWN notice carrying `body` to `client`.
    pub async fn shutdown_notice(&self, client: Frame, body: Multipart) -> Result<()> {
        self.control
            .send(Control::Shutdown { client, body })
            .await
            .map_err(|_| MufError::Closed)
    }

    /// Sends DISCONNECT to the broker and waits for the worker to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}
