use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::lock;

type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// Counts the live resources of one connection episode (tasks and
/// transport handles). When the last guard drops the callback runs once.
pub(crate) struct ReleaseTracker {
    live: AtomicUsize,
    on_released: Mutex<Option<ReleaseCallback>>,
}

impl ReleaseTracker {
    pub(crate) fn new(on_released: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            on_released: Mutex::new(Some(Box::new(on_released))),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>, resource: &'static str) -> ReleaseGuard {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "client", resource, live, "Resource acquired");
        ReleaseGuard {
            tracker: Arc::clone(self),
            resource,
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Held by a task or transport for as long as it is in use.
pub(crate) struct ReleaseGuard {
    tracker: Arc<ReleaseTracker>,
    resource: &'static str,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let remaining = self.tracker.live.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(target: "client", resource = self.resource, remaining, "Resource released");
        if remaining == 0 {
            let callback = lock(&self.tracker.on_released).take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}
