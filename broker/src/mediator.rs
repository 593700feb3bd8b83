//! Broker state machine: service and worker registries, dispatch,
//! heartbeats and eviction.
//!
//! The mediator never touches the network. Each call appends the messages
//! it wants delivered to an outbox that the broker loop drains.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use muf_core::protocol::{self, status, Inbound, WorkerCommand};
use muf_core::{Envelope, Frame, Multipart, Result};

/// A message waiting to be sent to peer `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Frame,
    pub frames: Multipart,
}

/// Reply bookkeeping for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyStatus {
    /// Nothing dispatched yet
    Idle,
    /// A request went out and no reply has come back
    Awaiting,
    Received,
}

struct Service {
    requests: VecDeque<Envelope>,
    /// Worker keys, oldest first
    waiting: VecDeque<String>,
    reply_status: ReplyStatus,
}

impl Service {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            waiting: VecDeque::new(),
            reply_status: ReplyStatus::Idle,
        }
    }
}

struct Worker {
    identity: Frame,
    service: Option<String>,
    expiry: Instant,
}

/// Point-in-time view of the registries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStatus {
    pub services: usize,
    pub pending_requests: usize,
    pub idle_workers: usize,
    pub workers: usize,
}

/// Per-service view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub pending_requests: usize,
    pub idle_workers: usize,
    pub awaiting_reply: bool,
}

pub struct Mediator {
    services: HashMap<String, Service>,
    workers: HashMap<String, Worker>,
    /// Every idle worker, ordered by last renewal
    waiting: VecDeque<String>,
    heartbeat_interval: Duration,
    heartbeat_expiry: Duration,
    heartbeat_at: Instant,
    outbox: Vec<Outbound>,
}

impl Mediator {
    pub fn new(heartbeat_interval: Duration, heartbeat_expiry: Duration, now: Instant) -> Self {
        Self {
            services: HashMap::new(),
            workers: HashMap::new(),
            waiting: VecDeque::new(),
            heartbeat_interval,
            heartbeat_expiry,
            heartbeat_at: now + heartbeat_interval,
            outbox: Vec::new(),
        }
    }

    /// Processes one message from peer `sender`.
    #[instrument(level = "trace", skip_all, fields(sender = %sender.hex()))]
    pub fn handle(&mut self, sender: Frame, frames: Multipart, now: Instant) -> Result<()> {
        match protocol::parse_inbound(frames)? {
            Inbound::Client { service, body } => {
                self.client_request(sender, service, body, now);
                Ok(())
            }
            Inbound::Worker(command) => self.worker_command(sender, command, now),
        }
    }

    fn client_request(&mut self, sender: Frame, service: Frame, body: Multipart, now: Instant) {
        let name = service.to_string_lossy();
        if protocol::is_internal_service(&name) {
            self.internal_service(sender, &name, body);
            return;
        }

        let reply_status = self.require_service(&name).reply_status;
        if reply_status == ReplyStatus::Awaiting {
            // Best effort: a retry while the previous reply is outstanding
            // re-readies a worker so the request is not stuck behind it.
            if let Some(key) = self.retry_candidate(&name, &sender) {
                debug!(target: "broker", service = %name, worker = %key, "Implicit re-ready on retry");
                self.bind_idle(&key, &name, now);
            }
        }
        let envelope = Envelope::new(body).wrap(sender);
        self.require_service(&name).requests.push_back(envelope);
        self.dispatch(&name, now);
    }

    /// The service's oldest idle worker, else a registered worker matching
    /// the sender identity that is unbound or bound to this service.
    fn retry_candidate(&self, service: &str, sender: &Frame) -> Option<String> {
        if let Some(key) = self.services.get(service).and_then(|s| s.waiting.front()) {
            return Some(key.clone());
        }
        let key = sender.hex();
        match self.workers.get(&key) {
            Some(w) if w.service.as_deref().map_or(true, |s| s == service) => Some(key),
            _ => None,
        }
    }

    fn internal_service(&mut self, sender: Frame, name: &str, mut body: Multipart) {
        let code = if name == protocol::SERVICE_QUERY {
            let queried = body.back().map(Frame::to_string_lossy).unwrap_or_default();
            if self.services.contains_key(&queried) {
                status::KNOWN_SERVICE
            } else {
                status::UNKNOWN_SERVICE
            }
        } else {
            status::NOT_IMPLEMENTED
        };
        debug!(target: "broker", service = name, code, "Internal service answered");
        match body.back_mut() {
            Some(last) => *last = Frame::from(code),
            None => body.push_back(code),
        }
        self.outbox.push(Outbound {
            to: sender,
            frames: protocol::client_message(name, body),
        });
    }

    fn worker_command(&mut self, sender: Frame, command: WorkerCommand, now: Instant) -> Result<()> {
        let key = sender.hex();
        let registered = self.workers.contains_key(&key);
        match command {
            WorkerCommand::Ready { service } => {
                if registered {
                    warn!(target: "broker", worker = %key, "Duplicate READY; dropping worker");
                    self.delete_worker(&key, false);
                } else if protocol::is_internal_service(&service) {
                    warn!(target: "broker", worker = %key, service = %service, "READY for internal service rejected");
                    self.outbox.push(Outbound {
                        to: sender,
                        frames: protocol::disconnect(),
                    });
                } else {
                    info!(target: "broker", worker = %key, service = %service, "Worker ready");
                    self.workers.insert(
                        key.clone(),
                        Worker {
                            identity: sender,
                            service: None,
                            expiry: now + self.heartbeat_expiry,
                        },
                    );
                    self.bind_idle(&key, &service, now);
                }
            }
            WorkerCommand::Reply(envelope) => {
                let Some(service) = self.bound_service(&key) else {
                    return self.reject_unregistered(sender, "REPLY");
                };
                let (client, envelope) = envelope.unwrap();
                if let Some(client) = client {
                    self.outbox.push(Outbound {
                        to: client,
                        frames: protocol::client_message(service.as_str(), envelope.into_body()),
                    });
                }
                self.require_service(&service).reply_status = ReplyStatus::Received;
                self.worker_waiting(&key, now);
            }
            WorkerCommand::Heartbeat => {
                if !registered {
                    return self.reject_unregistered(sender, "HEARTBEAT");
                }
                self.worker_waiting(&key, now);
            }
            WorkerCommand::Disconnect => {
                debug!(target: "broker", worker = %key, "Worker disconnected");
                self.delete_worker(&key, false);
            }
            WorkerCommand::Shutdown {
                envelope,
                service_marker,
            } => {
                let service = self.bound_service(&key).or(service_marker);
                let (client, envelope) = envelope.unwrap();
                match (service, client) {
                    (Some(service), Some(client)) => {
                        info!(target: "broker", service = %service, "Forwarding shutdown notice");
                        self.outbox.push(Outbound {
                            to: client,
                            frames: protocol::client_message(service.as_str(), envelope.into_body()),
                        });
                    }
                    _ => warn!(target: "broker", worker = %key, "SHUTDOWN without service or client; dropped"),
                }
            }
            WorkerCommand::Unknown(command) => {
                warn!(target: "broker", worker = %key, command = %command.hex(), "Invalid worker command; dropped");
            }
        }
        Ok(())
    }

    fn reject_unregistered(&mut self, sender: Frame, command: &str) -> Result<()> {
        let key = sender.hex();
        self.outbox.push(Outbound {
            to: sender,
            frames: protocol::disconnect(),
        });
        self.delete_worker(&key, false);
        Err(muf_core::MufError::ProtocolViolation(format!(
            "{command} from unregistered worker {key}"
        )))
    }

    fn bound_service(&self, key: &str) -> Option<String> {
        self.workers.get(key).and_then(|w| w.service.clone())
    }

    fn require_service(&mut self, name: &str) -> &mut Service {
        self.services.entry(name.to_string()).or_insert_with(|| {
            debug!(target: "broker", service = name, "Service registered");
            Service::new()
        })
    }

    /// Binds an unbound worker to `service`, then marks it idle.
    fn bind_idle(&mut self, key: &str, service: &str, now: Instant) {
        if let Some(worker) = self.workers.get_mut(key) {
            if worker.service.is_none() {
                worker.service = Some(service.to_string());
            }
        }
        self.require_service(service);
        self.worker_waiting(key, now);
    }

    /// Renews the worker, queues it as idle once and dispatches its service.
    fn worker_waiting(&mut self, key: &str, now: Instant) {
        let Some(worker) = self.workers.get_mut(key) else {
            return;
        };
        worker.expiry = now + self.heartbeat_expiry;
        let Some(service) = worker.service.clone() else {
            return;
        };
        self.waiting.retain(|k| k != key);
        self.waiting.push_back(key.to_string());
        let svc = self.require_service(&service);
        svc.waiting.retain(|k| k != key);
        svc.waiting.push_back(key.to_string());
        self.dispatch(&service, now);
    }

    /// Oldest request to oldest idle worker until either queue is empty.
    fn dispatch(&mut self, service: &str, now: Instant) {
        self.purge_workers(now);
        loop {
            let Some(svc) = self.services.get_mut(service) else {
                return;
            };
            if svc.requests.is_empty() || svc.waiting.is_empty() {
                return;
            }
            let (Some(key), Some(envelope)) = (svc.waiting.pop_front(), svc.requests.pop_front())
            else {
                return;
            };
            svc.reply_status = ReplyStatus::Awaiting;
            self.waiting.retain(|k| *k != key);
            if let Some(worker) = self.workers.get(&key) {
                debug!(target: "broker", service, worker = %key, "Dispatching request");
                self.outbox.push(Outbound {
                    to: worker.identity.clone(),
                    frames: protocol::request(&envelope),
                });
            }
        }
    }

    /// Evicts every idle worker whose expiry has passed.
    pub fn purge_workers(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .waiting
            .iter()
            .filter(|k| self.workers.get(*k).map_or(true, |w| w.expiry <= now))
            .cloned()
            .collect();
        for key in expired {
            info!(target: "broker", worker = %key, "Evicting expired worker");
            self.delete_worker(&key, false);
        }
    }

    /// Probes idle workers once the heartbeat interval has elapsed.
    pub fn send_heartbeats(&mut self, now: Instant) {
        if now < self.heartbeat_at {
            return;
        }
        for key in &self.waiting {
            if let Some(worker) = self.workers.get(key) {
                self.outbox.push(Outbound {
                    to: worker.identity.clone(),
                    frames: protocol::heartbeat(),
                });
            }
        }
        self.heartbeat_at = now + self.heartbeat_interval;
    }

    /// Sends DISCONNECT to every registered worker and clears the registry.
    pub fn disconnect_all(&mut self) {
        let keys: Vec<String> = self.workers.keys().cloned().collect();
        info!(target: "broker", workers = keys.len(), "Disconnecting all workers");
        for key in keys {
            self.delete_worker(&key, true);
        }
    }

    fn delete_worker(&mut self, key: &str, notify: bool) {
        self.waiting.retain(|k| k != key);
        let Some(worker) = self.workers.remove(key) else {
            return;
        };
        if let Some(service) = worker.service.as_deref().and_then(|s| self.services.get_mut(s)) {
            service.waiting.retain(|k| k != key);
        }
        if notify {
            self.outbox.push(Outbound {
                to: worker.identity,
                frames: protocol::disconnect(),
            });
        }
    }

    /// Takes everything queued for delivery.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            services: self.services.len(),
            pending_requests: self.services.values().map(|s| s.requests.len()).sum(),
            idle_workers: self.waiting.len(),
            workers: self.workers.len(),
        }
    }

    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.get(name).map(|s| ServiceStatus {
            pending_requests: s.requests.len(),
            idle_workers: s.waiting.len(),
            awaiting_reply: s.reply_status == ReplyStatus::Awaiting,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}
