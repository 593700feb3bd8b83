//! Client connection manager.
//!
//! A `ClientCommController` keeps one logical session with the system open:
//! it handshakes with the session-manager service, forwards queued outbound
//! messages and hands every inbound reply to a `ResponseListener`. Each
//! connection episode runs a Sender task and a Receiver task. When both
//! tasks and every transport of the episode have been released the
//! controller either reconnects or, once closed, destroys itself.

mod receiver;
mod release;
mod sender;
mod state;
mod watchdog;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::context::AppContext;
use crate::session::{request_type, SessionMessage};
use crate::transport::{Connector, GrpcConnector};
use crate::{MufError, Result};

use release::ReleaseTracker;
pub use state::{AtomicConnectionState, ConnectionState};

/// Receives every payload delivered to the client, including the
/// session manager's handshake reply.
pub trait ResponseListener: Send + Sync {
    fn process(&self, message: String);
}

impl<F> ResponseListener for F
where
    F: Fn(String) + Send + Sync,
{
    fn process(&self, message: String) {
        self(message)
    }
}

/// Lifecycle notifications published by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake accepted; traffic flows through `session_address`.
    Connected { session_address: String },
    /// Handshake rejected or timed out. Auto-reconnect pauses until the
    /// next `send`.
    ConnectFailed(String),
    /// All resources of an episode were released.
    Disconnected,
    Reconnecting,
    Destroyed,
}

pub(crate) struct Outbound {
    pub(crate) target: String,
    pub(crate) payload: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) service_name: String,
    pub(crate) server_address: String,
    pub(crate) client_address: String,
    pub(crate) session_manager_service: String,
    pub(crate) request_type: String,
    pub(crate) subscriptions: Vec<String>,
    pub(crate) config: ClientConfig,
}

/// The live episode, if any.
struct Episode {
    connect_failed: Arc<AtomicBool>,
}

pub(crate) struct Inner {
    pub(crate) ctx: AppContext,
    pub(crate) settings: Settings,
    pub(crate) connector: Arc<dyn Connector>,
    listener: RwLock<Option<Arc<dyn ResponseListener>>>,

    pub(crate) sent: AtomicU64,
    pub(crate) received: AtomicU64,
    pub(crate) suppress_next_reply: AtomicBool,
    /// A send arrived since the current episode started
    send_requested: AtomicBool,

    pub(crate) send_state: AtomicConnectionState,
    pub(crate) receive_state: AtomicConnectionState,
    release_state: AtomicConnectionState,

    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,

    closing: AtomicBool,
    destroyed: AtomicBool,
    destroyed_tx: watch::Sender<bool>,
    root: CancellationToken,
    episode: Mutex<Option<Episode>>,
    events: broadcast::Sender<ConnectionEvent>,
    on_destroyed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Starts a connection episode. Only runs from a released state.
    fn execute(self: &Arc<Self>) {
        // held until the episode is installed; close() reads the same slot
        let mut episode = lock(&self.episode);
        if self.closing.load(Ordering::SeqCst) || self.root.is_cancelled() {
            debug!(target: "client", "Controller closing; not starting an episode");
            return;
        }
        if self.release_state.load() != ConnectionState::Finished {
            debug!(target: "client", state = ?self.release_state.load(), "Episode already live");
            return;
        }
        let Some(outbound) = lock(&self.outbound_rx).take() else {
            warn!(target: "client", "Outbound queue still owned by a previous episode");
            return;
        };
        self.reset();

        let stop = self.root.child_token();
        let connect_failed = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(self);
        let tracker = ReleaseTracker::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_released();
            }
        });
        let sender_guard = tracker.acquire("sender");
        let receiver_guard = tracker.acquire("receiver");
        *episode = Some(Episode {
            connect_failed: connect_failed.clone(),
        });
        drop(episode);

        let (alive_tx, alive_rx) = oneshot::channel();
        info!(
            target: "client",
            service = %self.settings.service_name,
            server = %self.settings.server_address,
            "Starting connection episode"
        );
        tokio::spawn(sender::run(
            Arc::clone(self),
            sender::SenderTask {
                stop: stop.clone(),
                tracker,
                guard: sender_guard,
                outbound,
                alive: alive_tx,
                connect_failed,
            },
        ));
        tokio::spawn(receiver::run(
            Arc::clone(self),
            receiver::ReceiverTask {
                stop,
                guard: receiver_guard,
                alive: alive_rx,
            },
        ));
    }

    fn reset(&self) {
        self.sent.store(0, Ordering::SeqCst);
        self.received.store(0, Ordering::SeqCst);
        self.send_requested.store(false, Ordering::SeqCst);
        for state in [&self.send_state, &self.receive_state] {
            state.transition(ConnectionState::Finished);
            state.transition(ConnectionState::New);
        }
        self.release_state.transition(ConnectionState::New);
    }

    /// Runs when the last resource of an episode is released.
    fn on_released(self: &Arc<Self>) {
        let episode = lock(&self.episode).take();
        let connect_failed = episode
            .map(|e| e.connect_failed.load(Ordering::SeqCst))
            .unwrap_or(false);
        let _ = self.events.send(ConnectionEvent::Disconnected);
        // application shutdown destroys the controller like close()
        if self.root.is_cancelled() {
            self.closing.store(true, Ordering::SeqCst);
        }
        if self.closing.load(Ordering::SeqCst) {
            self.finish_destroy();
            return;
        }
        if connect_failed && !self.send_requested.swap(false, Ordering::SeqCst) {
            info!(target: "client", "Connect failed; reconnect deferred until next send");
            return;
        }
        self.reconnect();
    }

    /// Schedules a fresh episode. Concurrent calls collapse into one.
    fn reconnect(self: &Arc<Self>) {
        let (previous, current) = self.release_state.transition(ConnectionState::Started);
        if previous != ConnectionState::New || current != ConnectionState::Started {
            debug!(target: "client", state = ?previous, "Reconnect already scheduled");
            return;
        }
        info!(target: "client", service = %self.settings.service_name, "Reconnecting");
        let _ = self.events.send(ConnectionEvent::Reconnecting);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "client", "No runtime available; reconnect skipped");
            return;
        };
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            inner.release_state.transition(ConnectionState::Finished);
            inner.execute();
        });
    }

    fn finish_destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_state.transition(ConnectionState::Finished);
        info!(target: "client", service = %self.settings.service_name, "Gracefully destroyed");
        self.destroyed_tx.send_replace(true);
        let _ = self.events.send(ConnectionEvent::Destroyed);
        let callback = lock(&self.on_destroyed).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn is_idle(&self) -> bool {
        lock(&self.episode).is_none()
    }

    pub(crate) fn return_outbound(&self, outbound: mpsc::Receiver<Outbound>) {
        *lock(&self.outbound_rx) = Some(outbound);
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn deliver(&self, payload: String) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => listener.process(payload),
            None => warn!(target: "client", "No response listener set; dropping payload"),
        }
    }
}

/// Builds a `ClientCommController`. Must be finished inside a tokio runtime.
pub struct ClientCommControllerBuilder {
    service_name: Option<String>,
    server_address: Option<String>,
    client_address: Option<String>,
    session_manager_service: Option<String>,
    request_type: String,
    subscriptions: Vec<String>,
    listener: Option<Arc<dyn ResponseListener>>,
    connector: Option<Arc<dyn Connector>>,
    on_destroyed: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for ClientCommControllerBuilder {
    fn default() -> Self {
        Self {
            service_name: None,
            server_address: None,
            client_address: None,
            session_manager_service: None,
            request_type: request_type::REQUEST_CONNECT.to_string(),
            subscriptions: Vec::new(),
            listener: None,
            connector: None,
            on_destroyed: None,
        }
    }
}

impl ClientCommControllerBuilder {
    /// Identity announced to the session manager. Defaults to a random
    /// `client-<n>` name.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = Some(address.into());
        self
    }

    pub fn client_address(mut self, address: impl Into<String>) -> Self {
        self.client_address = Some(address.into());
        self
    }

    pub fn session_manager_service(mut self, service: impl Into<String>) -> Self {
        self.session_manager_service = Some(service.into());
        self
    }

    pub fn request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    pub fn subscriptions<I, S>(mut self, subscriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = subscriptions.into_iter().map(Into::into).collect();
        self
    }

    pub fn response_listener(mut self, listener: impl ResponseListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Transport used for both channels. Defaults to `GrpcConnector`.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Upstream notification run once the controller is destroyed.
    pub fn on_destroyed(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_destroyed = Some(Box::new(callback));
        self
    }

    /// Creates the controller and starts its first connection episode.
    pub fn build(self, ctx: &AppContext) -> ClientCommController {
        let config = ctx.config().client.clone();
        let service_name = self
            .service_name
            .unwrap_or_else(|| format!("client-{}", rand::thread_rng().gen::<u32>()));
        let settings = Settings {
            service_name,
            server_address: self
                .server_address
                .unwrap_or_else(|| config.server_address.clone()),
            client_address: self
                .client_address
                .unwrap_or_else(|| config.client_address.clone()),
            session_manager_service: self
                .session_manager_service
                .unwrap_or_else(|| config.session_manager_service.clone()),
            request_type: self.request_type,
            subscriptions: self.subscriptions,
            config,
        };
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.config.queue_capacity.max(1));
        let (destroyed_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            ctx: ctx.clone(),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(GrpcConnector::default())),
            listener: RwLock::new(self.listener),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            suppress_next_reply: AtomicBool::new(false),
            send_requested: AtomicBool::new(false),
            send_state: AtomicConnectionState::new(ConnectionState::New),
            receive_state: AtomicConnectionState::new(ConnectionState::New),
            release_state: AtomicConnectionState::new(ConnectionState::Finished),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            closing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            destroyed_tx,
            root: ctx.shutdown_token().child_token(),
            episode: Mutex::new(None),
            events,
            on_destroyed: Mutex::new(self.on_destroyed),
            settings,
        });
        inner.execute();
        ClientCommController { inner }
    }
}

/// Handle to a client session. Dropping it closes the session.
pub struct ClientCommController {
    inner: Arc<Inner>,
}

impl ClientCommController {
    pub fn builder() -> ClientCommControllerBuilder {
        ClientCommControllerBuilder::default()
    }

    pub fn service_name(&self) -> &str {
        &self.inner.settings.service_name
    }

    /// Queues `payload` for the service `target`. Waits when the outbound
    /// queue is full. Re-arms reconnection after a failed connect.
    pub async fn send(&self, target: impl Into<String>, payload: impl Into<String>) -> Result<()> {
        self.enqueue(target.into(), payload.into()).await
    }

    /// Like `send`, but the next inbound reply is counted and not delivered.
    pub async fn send_ignoring_reply(
        &self,
        target: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<()> {
        self.inner.suppress_next_reply.store(true, Ordering::SeqCst);
        self.enqueue(target.into(), payload.into()).await
    }

    /// Asks the session manager to end session `session_id`.
    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        let msg = SessionMessage::new(request_type::REQUEST_DISCONNECT, session_id);
        self.send(session_id, msg.to_json()?).await
    }

    async fn enqueue(&self, target: String, payload: String) -> Result<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(MufError::Closed);
        }
        self.inner.send_requested.store(true, Ordering::SeqCst);
        if self.inner.is_idle() {
            self.inner.reconnect();
        }
        self.inner
            .outbound_tx
            .send(Outbound { target, payload })
            .await
            .map_err(|_| MufError::Closed)
    }

    pub fn set_response_listener(&self, listener: impl ResponseListener + 'static) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn sent_messages(&self) -> u64 {
        self.inner.sent.load(Ordering::SeqCst)
    }

    pub fn received_messages(&self) -> u64 {
        self.inner.received.load(Ordering::SeqCst)
    }

    pub fn send_state(&self) -> ConnectionState {
        self.inner.send_state.load()
    }

    pub fn receive_state(&self) -> ConnectionState {
        self.inner.receive_state.load()
    }

    pub fn release_state(&self) -> ConnectionState {
        self.inner.release_state.load()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stops both tasks, releases every transport and destroys the
    /// controller without reconnecting. Idempotent.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "client", service = %self.inner.settings.service_name, "Closing");
        for state in [
            &self.inner.release_state,
            &self.inner.send_state,
            &self.inner.receive_state,
        ] {
            state.transition(ConnectionState::Stopped);
        }
        // cancels every episode stop token and the handshake watchdog
        self.inner.root.cancel();
        if self.inner.is_idle() {
            self.inner.finish_destroy();
        }
    }

    /// Resolves once the controller has been destroyed.
    pub async fn closed(&self) {
        let mut rx = self.inner.destroyed_tx.subscribe();
        let _ = rx.wait_for(|destroyed| *destroyed).await;
    }
}

impl Drop for ClientCommController {
    fn drop(&mut self) {
        self.close();
    }
}
