use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// One-shot timer guarding the connect handshake. Firing runs `on_expire`
/// once; cancelling first (or dropping the watchdog) suppresses it.
pub(crate) struct Watchdog {
    cancel: CancellationToken,
    expired: CancellationToken,
}

impl Watchdog {
    pub(crate) fn arm(
        cancel: CancellationToken,
        timeout: Duration,
        on_expire: impl FnOnce() + Send + 'static,
    ) -> Self {
        let expired = CancellationToken::new();
        let (token, fired) = (cancel.clone(), expired.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    fired.cancel();
                    on_expire();
                }
            }
        });
        Self { cancel, expired }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the timer has fired.
    pub(crate) async fn expired(&self) {
        self.expired.cancelled().await
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let dog = Watchdog::arm(CancellationToken::new(), Duration::from_secs(20), move || {
            flag.store(true, Ordering::SeqCst)
        });
        dog.expired().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_watchdog_stays_silent() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let dog = Watchdog::arm(CancellationToken::new(), Duration::from_secs(20), move || {
            flag.store(true, Ordering::SeqCst)
        });
        dog.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
