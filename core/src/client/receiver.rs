use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::release::ReleaseGuard;
use super::{ConnectionState, Inner};
use crate::protocol;
use crate::session::STOP_SENTINEL;
use crate::transport::FrameStream;

pub(crate) struct ReceiverTask {
    pub(crate) stop: CancellationToken,
    pub(crate) guard: ReleaseGuard,
    pub(crate) alive: oneshot::Receiver<Box<dyn FrameStream>>,
}

pub(crate) async fn run(inner: Arc<Inner>, task: ReceiverTask) {
    let ReceiverTask { stop, guard, alive } = task;

    // A dropped alive sender means the handshake never completed.
    let stream = tokio::select! {
        _ = stop.cancelled() => None,
        stream = alive => stream.ok(),
    };
    if let Some(mut stream) = stream {
        inner.receive_state.transition(ConnectionState::Started);
        receive(&inner, &stop, stream.as_mut()).await;
        inner.receive_state.transition(ConnectionState::Finished);
    }

    stop.cancel();
    drop(guard);
}

async fn receive(inner: &Inner, stop: &CancellationToken, stream: &mut dyn FrameStream) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            next = stream.recv() => next,
        };
        let frames = match next {
            Ok(Some(frames)) => frames,
            Ok(None) => {
                debug!(target: "client", "Inbound stream closed");
                return;
            }
            Err(err) => {
                warn!(target: "client", error = %err, "Receive failed; tearing down episode");
                return;
            }
        };
        let reply = match protocol::parse_client_reply(frames) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(target: "client", error = %err, "Dropping malformed reply");
                continue;
            }
        };
        let payload = reply.payload();
        if payload == STOP_SENTINEL {
            info!(target: "client", service = %reply.service, "Stop requested by peer");
            return;
        }
        inner.received.fetch_add(1, Ordering::SeqCst);
        if inner.suppress_next_reply.swap(false, Ordering::SeqCst) {
            debug!(target: "client", service = %reply.service, "Reply suppressed");
            continue;
        }
        inner.deliver(payload);
    }
}
