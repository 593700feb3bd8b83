use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use muf_core::{Frame, Multipart};
use muf_proto::FrameRouter;

/// A message from one peer: routing identity plus frames.
pub type Inbound = (Frame, Multipart);

/// gRPC endpoint where every opened stream is a peer with its own identity.
#[derive(Clone)]
pub struct RouterService {
    next_id: Arc<AtomicU64>,
    // identity -> sender feeding that peer's outbound stream
    peers: Arc<DashMap<Frame, mpsc::Sender<muf_proto::Multipart>>>,
    inbound: mpsc::Sender<Inbound>,
    peer_capacity: usize,
}

impl RouterService {
    pub fn new(inbound: mpsc::Sender<Inbound>, peer_capacity: usize) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            peers: Arc::new(DashMap::new()),
            inbound,
            peer_capacity: peer_capacity.max(1),
        }
    }

    /// Non-blocking send. Messages to a vanished or saturated peer are dropped.
    pub fn send(&self, identity: &Frame, frames: Multipart) {
        let Some(peer) = self.peers.get(identity).map(|p| p.clone()) else {
            debug!(target: "router", peer = %identity.hex(), "Dropping message for unknown peer");
            return;
        };
        match peer.try_send(frames.into()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(target: "router", peer = %identity.hex(), "Peer outbound full; dropping message")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "router", peer = %identity.hex(), "Peer gone; dropping message");
                self.peers.remove(identity);
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Closes every peer stream.
    pub fn close_all(&self) {
        self.peers.clear();
    }

    fn next_identity(&self) -> Frame {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Frame::new(id.to_be_bytes().to_vec())
    }
}

#[tonic::async_trait]
impl FrameRouter for RouterService {
    type OpenStream = Pin<
        Box<dyn futures_core::Stream<Item = std::result::Result<muf_proto::Multipart, Status>> + Send>,
    >;

    async fn open(
        &self,
        request: Request<tonic::Streaming<muf_proto::Multipart>>,
    ) -> std::result::Result<Response<Self::OpenStream>, Status> {
        let mut stream = request.into_inner();
        let identity = self.next_identity();
        let (tx, rx) = mpsc::channel::<muf_proto::Multipart>(self.peer_capacity);
        self.peers.insert(identity.clone(), tx);
        info!(target: "router", peer = %identity.hex(), "Peer connected");

        let inbound = self.inbound.clone();
        let peers = Arc::clone(&self.peers);
        let peer = identity.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.message().await.transpose() {
                if inbound.send((peer.clone(), msg.into())).await.is_err() {
                    break; // broker loop gone
                }
            }
            info!(target: "router", peer = %peer.hex(), "Peer stream ended");
            peers.remove(&peer);
        });

        let outbound = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound) as Self::OpenStream))
    }
}
