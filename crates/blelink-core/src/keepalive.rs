//! RSSI keepalive and per-phase timeout scheduling.
//!
//! The platform BLE stack drops idle connections after an unspecified
//! quiet period; any BLE operation refreshes that timer, so a periodic
//! RSSI read while `Connected` keeps the link alive without sending
//! payload traffic. This module also centralizes the arming of the
//! per-phase timeout tasks the phase-ownership table documents.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WARN_AFTER_CONSECUTIVE_FAILURES: u32 = 3;
const WARN_EVERY_NTH_FAILURE_THEREAFTER: u32 = 10;

/// Counts consecutive RSSI-keepalive failures and decides when to log.
#[derive(Debug, Default)]
pub struct KeepaliveFailureCounter {
    consecutive: AtomicU32,
}

impl KeepaliveFailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed RSSI read. Returns `true` if this failure should be
    /// logged as a warning (the 3rd consecutive failure, then every 10th
    /// thereafter).
    pub fn record_failure(&self) -> u32 {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count == WARN_AFTER_CONSECUTIVE_FAILURES
            || (count > WARN_AFTER_CONSECUTIVE_FAILURES
                && (count - WARN_AFTER_CONSECUTIVE_FAILURES) % WARN_EVERY_NTH_FAILURE_THEREAFTER
                    == 0)
        {
            warn!(consecutive_failures = count, "RSSI keepalive failing");
        }
        count
    }

    /// Record a successful RSSI read. Resets the counter and logs once if
    /// recovering from a run of failures.
    pub fn record_success(&self) {
        let previous = self.consecutive.swap(0, Ordering::SeqCst);
        if previous >= WARN_AFTER_CONSECUTIVE_FAILURES {
            info!(previous_failures = previous, "RSSI keepalive recovered");
        }
    }

    pub fn current(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

/// Spawn a per-phase timeout task. Fires `on_timeout` with the `tag`
/// generation stamp unless `token` is cancelled first (the phase was left
/// by some other path). The caller is responsible for validating `tag`
/// against the live generation before acting, since the timeout and the
/// success path race by design.
pub fn spawn_phase_timeout<F>(
    duration: Duration,
    token: CancellationToken,
    tag: u64,
    on_timeout: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnOnce(u64) + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(duration) => on_timeout(tag),
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32 as TestCounter;

    #[test]
    fn test_warns_on_third_consecutive_failure() {
        let counter = KeepaliveFailureCounter::new();
        assert_eq!(counter.record_failure(), 1);
        assert_eq!(counter.record_failure(), 2);
        assert_eq!(counter.record_failure(), 3);
        assert_eq!(counter.current(), 3);
    }

    #[test]
    fn test_success_resets_counter() {
        let counter = KeepaliveFailureCounter::new();
        counter.record_failure();
        counter.record_failure();
        counter.record_success();
        assert_eq!(counter.current(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_timeout_fires_with_tag_when_not_cancelled() {
        let fired = Arc::new(TestCounter::new(0));
        let fired_clone = Arc::clone(&fired);
        let token = CancellationToken::new();
        spawn_phase_timeout(Duration::from_millis(10), token, 7, move |tag| {
            fired_clone.store(tag as u32, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_timeout_suppressed_by_cancellation() {
        let fired = Arc::new(TestCounter::new(0));
        let fired_clone = Arc::clone(&fired);
        let token = CancellationToken::new();
        let token_clone = token.clone();
        spawn_phase_timeout(Duration::from_millis(10), token_clone, 1, move |_| {
            fired_clone.store(1, Ordering::SeqCst);
        });
        token.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
