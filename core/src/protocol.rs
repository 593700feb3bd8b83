//! Majordomo-style wire protocol shared by broker, clients and workers.
//!
//! Every message starts with an empty delimiter frame followed by a role
//! header. Wire sequences (after the transport's own identity frame):
//!
//! ```text
//! client -> broker   [""][MDPC01][service][body...]
//! broker -> client   [""][MDPC01][service][body...]
//! worker -> broker   [""][MDPW01][READY][service]
//!                    [""][MDPW01][REPLY][client][""][body...]
//!                    [""][MDPW01][HEARTBEAT] / [DISCONNECT]
//!                    [""][MDPW01][SHUTDOWN][client][""][body...][SERVICE_NAME:x]?
//! broker -> worker   [""][MDPW01][REQUEST][client][""][body...]
//!                    [""][MDPW01][HEARTBEAT] / [DISCONNECT]
//! ```

use crate::envelope::Envelope;
use crate::frame::{Frame, Multipart};
use crate::{MufError, Result};

/// Role header carried by client traffic.
pub const CLIENT: &str = "MDPC01";
/// Role header carried by worker traffic.
pub const WORKER: &str = "MDPW01";

/// Service names with this prefix are answered by the broker itself.
pub const INTERNAL_SERVICE_PREFIX: &str = "mmi.";
/// Internal query: "is service X known?"
pub const SERVICE_QUERY: &str = "mmi.service";
/// Trailing marker naming the service on SHUTDOWN frames from unbound workers.
pub const SERVICE_NAME_MARKER: &str = "SERVICE_NAME:";

/// Status codes returned by internal services.
pub mod status {
    pub const KNOWN_SERVICE: &str = "200";
    pub const UNKNOWN_SERVICE: &str = "400";
    pub const NOT_IMPLEMENTED: &str = "501";
}

/// Worker protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ready = 0x01,
    Request = 0x02,
    Reply = 0x03,
    Heartbeat = 0x04,
    Disconnect = 0x05,
    Shutdown = 0x06,
}

impl Command {
    pub fn frame(self) -> Frame {
        Frame::new(vec![self as u8])
    }

    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.as_bytes() {
            [0x01] => Some(Command::Ready),
            [0x02] => Some(Command::Request),
            [0x03] => Some(Command::Reply),
            [0x04] => Some(Command::Heartbeat),
            [0x05] => Some(Command::Disconnect),
            [0x06] => Some(Command::Shutdown),
            _ => None,
        }
    }
}

pub fn is_internal_service(name: &str) -> bool {
    name.starts_with(INTERNAL_SERVICE_PREFIX)
}

/// A command received by the broker from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Ready { service: String },
    Reply(Envelope),
    Heartbeat,
    Disconnect,
    Shutdown {
        envelope: Envelope,
        service_marker: Option<String>,
    },
    /// Garbled or unsupported command frame.
    Unknown(Frame),
}

/// A message received by the broker, classified by role header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Client { service: Frame, body: Multipart },
    Worker(WorkerCommand),
}

/// Classifies a broker-bound message (identity frame already removed).
pub fn parse_inbound(mut frames: Multipart) -> Result<Inbound> {
    let empty = frames
        .pop_front()
        .ok_or_else(|| violation("missing delimiter"))?;
    if !empty.is_empty() {
        return Err(violation("first frame is not an empty delimiter"));
    }
    let header = frames
        .pop_front()
        .ok_or_else(|| violation("missing role header"))?;
    if header == CLIENT {
        // service name + body
        if frames.len() < 2 {
            return Err(violation("client message needs service and body"));
        }
        let service = frames.pop_front().ok_or_else(|| violation("missing service"))?;
        Ok(Inbound::Client {
            service,
            body: frames,
        })
    } else if header == WORKER {
        parse_worker_command(frames).map(Inbound::Worker)
    } else {
        Err(violation(&format!("unknown role header {header:?}")))
    }
}

fn parse_worker_command(mut frames: Multipart) -> Result<WorkerCommand> {
    let command = frames
        .pop_front()
        .ok_or_else(|| violation("missing worker command"))?;
    let parsed = match Command::from_frame(&command) {
        Some(Command::Ready) => {
            let service = frames
                .pop_front()
                .ok_or_else(|| violation("READY without service name"))?;
            WorkerCommand::Ready {
                service: service.to_string_lossy(),
            }
        }
        Some(Command::Reply) => {
            let envelope =
                Envelope::parse(frames, 1).ok_or_else(|| violation("REPLY without envelope"))?;
            WorkerCommand::Reply(envelope)
        }
        Some(Command::Heartbeat) => WorkerCommand::Heartbeat,
        Some(Command::Disconnect) => WorkerCommand::Disconnect,
        Some(Command::Shutdown) => {
            let service_marker = match frames.back() {
                Some(last) if last.starts_with(SERVICE_NAME_MARKER) => frames
                    .pop_back()
                    .map(|f| f.to_string_lossy()[SERVICE_NAME_MARKER.len()..].to_string()),
                _ => None,
            };
            let envelope = Envelope::parse(frames, 1)
                .ok_or_else(|| violation("SHUTDOWN without envelope"))?;
            WorkerCommand::Shutdown {
                envelope,
                service_marker,
            }
        }
        // REQUEST only flows broker -> worker
        Some(Command::Request) | None => WorkerCommand::Unknown(command),
    };
    Ok(parsed)
}

/// A command received by a worker from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCommand {
    Request(Envelope),
    Heartbeat,
    Disconnect,
}

/// Parses a worker-bound message.
pub fn parse_broker_command(mut frames: Multipart) -> Result<BrokerCommand> {
    let empty = frames
        .pop_front()
        .ok_or_else(|| violation("missing delimiter"))?;
    let header = frames
        .pop_front()
        .ok_or_else(|| violation("missing role header"))?;
    if !empty.is_empty() || header != WORKER {
        return Err(violation("not a worker message"));
    }
    let command = frames
        .pop_front()
        .ok_or_else(|| violation("missing command"))?;
    match Command::from_frame(&command) {
        Some(Command::Request) => Envelope::parse(frames, 1)
            .map(BrokerCommand::Request)
            .ok_or_else(|| violation("REQUEST without envelope")),
        Some(Command::Heartbeat) => Ok(BrokerCommand::Heartbeat),
        Some(Command::Disconnect) => Ok(BrokerCommand::Disconnect),
        _ => Err(violation(&format!("unexpected command {command:?}"))),
    }
}

/// A reply delivered to a client: originating service plus body frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReply {
    pub service: String,
    pub body: Multipart,
}

impl ClientReply {
    /// The payload a response listener sees: the last body frame.
    pub fn payload(&self) -> String {
        self.body
            .back()
            .map(Frame::to_string_lossy)
            .unwrap_or_default()
    }
}

/// Parses a client-bound message.
pub fn parse_client_reply(mut frames: Multipart) -> Result<ClientReply> {
    let empty = frames
        .pop_front()
        .ok_or_else(|| violation("missing delimiter"))?;
    let header = frames
        .pop_front()
        .ok_or_else(|| violation("missing role header"))?;
    if !empty.is_empty() || header != CLIENT {
        return Err(violation("not a client message"));
    }
    let service = frames
        .pop_front()
        .ok_or_else(|| violation("missing service"))?;
    Ok(ClientReply {
        service: service.to_string_lossy(),
        body: frames,
    })
}

/// `[""][MDPC01][service][body...]`, both directions.
pub fn client_message(service: impl Into<Frame>, body: Multipart) -> Multipart {
    let mut msg = Multipart::new()
        .with(Frame::empty())
        .with(CLIENT)
        .with(service);
    msg.append(body);
    msg
}

/// `[""][MDPW01][command][rest...]`
pub fn worker_message(command: Command, rest: Multipart) -> Multipart {
    let mut msg = Multipart::new()
        .with(Frame::empty())
        .with(WORKER)
        .with(command.frame());
    msg.append(rest);
    msg
}

pub fn ready(service: &str) -> Multipart {
    worker_message(Command::Ready, Multipart::new().with(service))
}

pub fn heartbeat() -> Multipart {
    worker_message(Command::Heartbeat, Multipart::new())
}

pub fn disconnect() -> Multipart {
    worker_message(Command::Disconnect, Multipart::new())
}

pub fn request(envelope: &Envelope) -> Multipart {
    worker_message(Command::Request, envelope.to_multipart())
}

pub fn reply(envelope: &Envelope) -> Multipart {
    worker_message(Command::Reply, envelope.to_multipart())
}

/// SHUTDOWN notice. Unbound workers name the service with a trailing marker.
pub fn shutdown(envelope: &Envelope, service: Option<&str>) -> Multipart {
    let mut rest = envelope.to_multipart();
    if let Some(service) = service {
        rest.push_back(format!("{SERVICE_NAME_MARKER}{service}"));
    }
    worker_message(Command::Shutdown, rest)
}

fn violation(reason: &str) -> MufError {
    MufError::ProtocolViolation(reason.to_string())
}
