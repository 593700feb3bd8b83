use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::release::{ReleaseGuard, ReleaseTracker};
use super::watchdog::Watchdog;
use super::{ConnectionEvent, ConnectionState, Inner, Outbound};
use crate::frame::Multipart;
use crate::protocol;
use crate::session::{request_type, SessionMessage, STOP_SENTINEL};
use crate::transport::{Connection, FrameSink, FrameStream};
use crate::{MufError, Result};

pub(crate) struct SenderTask {
    pub(crate) stop: CancellationToken,
    pub(crate) tracker: Arc<ReleaseTracker>,
    pub(crate) guard: ReleaseGuard,
    pub(crate) outbound: mpsc::Receiver<Outbound>,
    /// Hands the receive half to the Receiver once the handshake succeeds.
    pub(crate) alive: oneshot::Sender<Box<dyn FrameStream>>,
    pub(crate) connect_failed: Arc<AtomicBool>,
}

/// A transport send half tied to its release guard.
struct Channel {
    sink: Box<dyn FrameSink>,
    _guard: ReleaseGuard,
}

struct Link {
    manager: Channel,
    /// `None` when the session lives on the manager transport.
    session: Option<Channel>,
    session_address: String,
    stream: Box<dyn FrameStream>,
}

pub(crate) async fn run(inner: Arc<Inner>, task: SenderTask) {
    let SenderTask {
        stop,
        tracker,
        guard,
        mut outbound,
        alive,
        connect_failed,
    } = task;
    inner.send_state.transition(ConnectionState::Started);

    let mut link = None;
    match handshake(&inner, &stop, &tracker).await {
        Ok(Link {
            manager,
            session,
            session_address,
            stream,
        }) => {
            if alive.send(stream).is_ok() {
                info!(target: "client", session = %session_address, "Session established");
                inner.emit(ConnectionEvent::Connected { session_address });
                let (mut manager, mut session) = (manager, session);
                forward(&inner, &stop, &mut outbound, &mut manager, session.as_mut()).await;
                link = Some((manager, session));
            }
        }
        Err(MufError::Closed) => debug!(target: "client", "Handshake abandoned"),
        Err(err) => {
            connect_failed.store(true, Ordering::SeqCst);
            // the watchdog already reported its own expiry
            if !matches!(err, MufError::HandshakeTimeout { .. }) {
                inner.ctx.errors().handle("client.sender", &err);
            }
            inner.emit(ConnectionEvent::ConnectFailed(err.to_string()));
        }
    }

    stop.cancel();
    inner.return_outbound(outbound);
    inner.send_state.transition(ConnectionState::Finished);
    drop(link);
    drop(guard);
}

async fn handshake(
    inner: &Arc<Inner>,
    stop: &CancellationToken,
    tracker: &Arc<ReleaseTracker>,
) -> Result<Link> {
    let settings = &inner.settings;
    let Connection {
        sink,
        stream: mut manager_stream,
    } = tokio::select! {
        biased;
        _ = stop.cancelled() => return Err(MufError::Closed),
        conn = inner.connector.connect(&settings.server_address) => conn?,
    };
    let mut manager = Channel {
        sink,
        _guard: tracker.acquire("manager-transport"),
    };

    let timeout = settings.config.handshake_timeout();
    let errors = inner.ctx.errors().clone();
    let address = settings.server_address.clone();
    let watchdog = Watchdog::arm(stop.child_token(), timeout, move || {
        errors.handle(
            "client.watchdog",
            &MufError::HandshakeTimeout {
                address,
                timeout_ms: timeout.as_millis() as u64,
            },
        );
    });

    let request = SessionMessage::new(&settings.request_type, &settings.service_name)
        .with_url(&settings.client_address)
        .with_payload(serde_json::to_string(&settings.subscriptions)?);
    debug!(target: "client", manager = %settings.session_manager_service, "Sending connect request");
    manager
        .sink
        .send(protocol::client_message(
            settings.session_manager_service.as_str(),
            Multipart::new().with(request.to_json()?),
        ))
        .await?;

    let frames = tokio::select! {
        biased;
        _ = stop.cancelled() => return Err(MufError::Closed),
        reply = manager_stream.recv() => reply?.ok_or(MufError::TransportInterrupted)?,
        _ = watchdog.expired() => {
            return Err(MufError::HandshakeTimeout {
                address: settings.server_address.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };
    watchdog.cancel();

    let payload = protocol::parse_client_reply(frames)?.payload();
    if payload == STOP_SENTINEL {
        return Err(MufError::ConnectRejected(STOP_SENTINEL.to_string()));
    }
    let reply = SessionMessage::from_json(&payload)
        .map_err(|e| MufError::ProtocolViolation(format!("handshake reply: {e}")))?;
    if reply.is_rejection() {
        return Err(MufError::ConnectRejected(reply.request_type));
    }

    let mut session_address = settings.server_address.clone();
    let mut session = None;
    let mut stream = manager_stream;
    if reply.request_type == request_type::SESSION_INITIATED
        && !reply.payload.is_empty()
        && reply.payload != settings.server_address
    {
        info!(target: "client", address = %reply.payload, "Opening session transport");
        let Connection {
            sink,
            stream: session_stream,
        } = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(MufError::Closed),
            conn = inner.connector.connect(&reply.payload) => conn?,
        };
        session = Some(Channel {
            sink,
            _guard: tracker.acquire("session-transport"),
        });
        stream = session_stream;
        session_address = reply.payload.clone();
    }

    inner.deliver(payload);
    Ok(Link {
        manager,
        session,
        session_address,
        stream,
    })
}

/// Drains the outbound queue until stopped, tripped or interrupted.
async fn forward(
    inner: &Inner,
    stop: &CancellationToken,
    outbound: &mut mpsc::Receiver<Outbound>,
    manager: &mut Channel,
    mut session: Option<&mut Channel>,
) {
    let settings = &inner.settings;
    let threshold = settings.config.backpressure_threshold;
    loop {
        let sent = inner.sent.load(Ordering::SeqCst);
        let gap = sent.saturating_sub(inner.received.load(Ordering::SeqCst));
        if gap > threshold {
            warn!(target: "client", sent, gap, threshold, "Backpressure threshold exceeded; stopping sender");
            return;
        }

        let msg = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        let channel = match session.as_deref_mut() {
            Some(channel) if msg.target != settings.session_manager_service => channel,
            _ => &mut *manager,
        };
        let frames =
            protocol::client_message(msg.target.as_str(), Multipart::new().with(msg.payload));
        match channel.sink.send(frames).await {
            Ok(()) => {
                inner.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                warn!(target: "client", error = %err, target_service = %msg.target, "Send failed; tearing down episode");
                return;
            }
        }
    }
}
