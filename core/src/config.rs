use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{MufError, Result};

/// Top-level configuration, immutable once handed to an `AppContext`.
#[derive(Clone, Debug, Default)]
pub struct MufConfig {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
    pub worker: WorkerConfig,
    pub error_policy: ErrorPolicy,
}

/// Broker endpoint and heartbeat settings
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub bind_address: String,
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat intervals before a worker is evicted
    pub heartbeat_liveness: u32,
    /// Capacity of the router -> mediator inbound channel
    pub inbound_capacity: usize,
    /// Capacity of each peer's outbound stream
    pub peer_capacity: usize,
}

/// Client connection manager settings
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_address: String,
    pub client_address: String,
    pub session_manager_service: String,
    pub handshake_timeout_ms: u64,
    /// Sender stops once sent - received exceeds this
    pub backpressure_threshold: u64,
    pub queue_capacity: usize,
}

/// Worker session settings
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub broker_address: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_liveness: u32,
    pub reconnect_delay_ms: u64,
}

/// What the central error handler does with non-recoverable failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log and keep running
    #[default]
    Log,
    /// Log and cancel the application shutdown token
    Shutdown,
}

impl FromStr for ErrorPolicy {
    type Err = MufError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(ErrorPolicy::Log),
            "shutdown" => Ok(ErrorPolicy::Shutdown),
            other => Err(MufError::Config(format!("unknown error policy: {other}"))),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: env_or("MUF_BROKER_ADDR", "0.0.0.0:5555".to_string()),
            heartbeat_interval_ms: env_or("MUF_HEARTBEAT_INTERVAL_MS", 2_500),
            heartbeat_liveness: env_or("MUF_HEARTBEAT_LIVENESS", 5),
            inbound_capacity: 1_024,
            peer_capacity: 256,
        }
    }
}

impl BrokerConfig {
    /// Never shorter than 1 ms; a zero interval would spin the broker loop.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// A worker not heard from for this long is considered dead.
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_liveness
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let server_address = env_or("MUF_SERVER_ADDRESS", "127.0.0.1:5555".to_string());
        Self {
            client_address: env_or("MUF_CLIENT_ADDRESS", server_address.clone()),
            server_address,
            session_manager_service: env_or(
                "MUF_SESSION_MANAGER_SERVICE",
                "session-manager".to_string(),
            ),
            handshake_timeout_ms: env_or("MUF_HANDSHAKE_TIMEOUT_MS", 20_000),
            backpressure_threshold: env_or("MUF_BACKPRESSURE_THRESHOLD", 100),
            queue_capacity: 1_024,
        }
    }
}

impl ClientConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_address: env_or("MUF_SERVER_ADDRESS", "127.0.0.1:5555".to_string()),
            heartbeat_interval_ms: env_or("MUF_HEARTBEAT_INTERVAL_MS", 2_500),
            heartbeat_liveness: env_or("MUF_HEARTBEAT_LIVENESS", 5),
            reconnect_delay_ms: 2_500,
        }
    }
}

impl WorkerConfig {
    /// Clamped to at least 1 ms like the broker's.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl MufConfig {
    /// Load configuration from a TOML file (path via MUF_CONFIG or ./muf.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::from_env();
        let path = std::env::var("MUF_CONFIG").unwrap_or_else(|_| "muf.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<MufToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Defaults plus environment overrides, no file.
    pub fn from_env() -> Self {
        Self {
            error_policy: env_or("MUF_ERROR_POLICY", ErrorPolicy::Log),
            ..Self::default()
        }
    }

    /// Parse a TOML document strictly, overlaying it onto env defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t = toml::from_str::<MufToml>(s).map_err(|e| MufError::Config(e.to_string()))?;
        Ok(t.overlay(Self::from_env()))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, Deserialize)]
struct MufToml {
    error_policy: Option<ErrorPolicy>,
    broker: Option<BrokerToml>,
    client: Option<ClientToml>,
    worker: Option<WorkerToml>,
}

impl MufToml {
    fn overlay(self, mut base: MufConfig) -> MufConfig {
        if let Some(p) = self.error_policy {
            base.error_policy = p;
        }
        if let Some(b) = self.broker {
            b.apply(&mut base.broker);
        }
        if let Some(c) = self.client {
            c.apply(&mut base.client);
        }
        if let Some(w) = self.worker {
            w.apply(&mut base.worker);
        }
        base
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BrokerToml {
    bind_address: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_liveness: Option<u32>,
    inbound_capacity: Option<usize>,
    peer_capacity: Option<usize>,
}

impl BrokerToml {
    fn apply(self, cfg: &mut BrokerConfig) {
        if let Some(v) = self.bind_address {
            cfg.bind_address = v;
        }
        if let Some(v) = self.heartbeat_interval_ms {
            cfg.heartbeat_interval_ms = v;
        }
        if let Some(v) = self.heartbeat_liveness {
            cfg.heartbeat_liveness = v;
        }
        if let Some(v) = self.inbound_capacity {
            cfg.inbound_capacity = v;
        }
        if let Some(v) = self.peer_capacity {
            cfg.peer_capacity = v;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClientToml {
    server_address: Option<String>,
    client_address: Option<String>,
    session_manager_service: Option<String>,
    handshake_timeout_ms: Option<u64>,
    backpressure_threshold: Option<u64>,
    queue_capacity: Option<usize>,
}

impl ClientToml {
    fn apply(self, cfg: &mut ClientConfig) {
        if let Some(v) = self.server_address {
            cfg.server_address = v;
        }
        if let Some(v) = self.client_address {
            cfg.client_address = v;
        }
        if let Some(v) = self.session_manager_service {
            cfg.session_manager_service = v;
        }
        if let Some(v) = self.handshake_timeout_ms {
            cfg.handshake_timeout_ms = v;
        }
        if let Some(v) = self.backpressure_threshold {
            cfg.backpressure_threshold = v;
        }
        if let Some(v) = self.queue_capacity {
            cfg.queue_capacity = v;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkerToml {
    broker_address: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_liveness: Option<u32>,
    reconnect_delay_ms: Option<u64>,
}

impl WorkerToml {
    fn apply(self, cfg: &mut WorkerConfig) {
        if let Some(v) = self.broker_address {
            cfg.broker_address = v;
        }
        if let Some(v) = self.heartbeat_interval_ms {
            cfg.heartbeat_interval_ms = v;
        }
        if let Some(v) = self.heartbeat_liveness {
            cfg.heartbeat_liveness = v;
        }
        if let Some(v) = self.reconnect_delay_ms {
            cfg.reconnect_delay_ms = v;
        }
    }
}
