use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::{ErrorPolicy, MufConfig};
use crate::MufError;

/// Application-wide values constructed once by the host program and passed
/// by reference into the broker, controllers and workers.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<MufConfig>,
    errors: ErrorHandler,
    shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: MufConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            errors: ErrorHandler::new(config.error_policy, shutdown.clone()),
            config: Arc::new(config),
            shutdown,
        }
    }

    pub fn config(&self) -> &MufConfig {
        &self.config
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    /// Cancelled when the host (or the error policy) asks everything to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(MufConfig::default())
    }
}

/// Central sink for unexpected failures.
///
/// Recoverable errors are logged at warn level. Anything else is logged at
/// error level and, under `ErrorPolicy::Shutdown`, cancels the application
/// shutdown token. That is the only path allowed to stop the process.
#[derive(Clone)]
pub struct ErrorHandler {
    policy: ErrorPolicy,
    shutdown: CancellationToken,
    reported: Arc<AtomicU64>,
}

impl ErrorHandler {
    fn new(policy: ErrorPolicy, shutdown: CancellationToken) -> Self {
        Self {
            policy,
            shutdown,
            reported: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self, origin: &str, err: &MufError) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        if err.is_recoverable() {
            warn!(target: "errors", origin, error = %err, "Recoverable failure");
            return;
        }
        error!(target: "errors", origin, error = %err, policy = ?self.policy, "Unexpected failure");
        if self.policy == ErrorPolicy::Shutdown {
            self.shutdown.cancel();
        }
    }

    /// Number of failures reported so far
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}
