//! Diagnostics collector for the connection state machine.
//!
//! Tracks the counters and bounded history a host application's
//! diagnostics screen wants: consecutive RSSI-keepalive failures, write
//! outcomes, a ring of recent phase transitions, and the last N errors by
//! category. Purely observational — nothing here drives behavior.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Error;
use crate::events::DisconnectReason;

/// Maximum number of recent errors to keep in the diagnostics buffer.
const MAX_RECENT_ERRORS: usize = 100;

/// Maximum number of recent phase transitions to keep.
const MAX_RECENT_TRANSITIONS: usize = 100;

/// Categories of errors for classification, collapsed from [`Error`]'s
/// variants into the buckets a diagnostics screen cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Radio itself unavailable, unauthorized, or powered off.
    Radio,
    /// Connection setup failed or timed out.
    Connection,
    /// A write timed out, was rejected, or the platform reported failure.
    Write,
    /// The requested device could not be found or resolved.
    DeviceNotFound,
    /// `connect`/`switch_device` called while already in operation.
    AlreadyInOperation,
    /// Caller-requested cancellation, or a callback dropped as stale.
    Cancelled,
    /// Any other BLE driver error.
    Other,
}

impl From<&Error> for ErrorCategory {
    fn from(error: &Error) -> Self {
        match error {
            Error::RadioUnavailable | Error::RadioUnauthorized | Error::RadioPoweredOff => {
                ErrorCategory::Radio
            }
            Error::DeviceNotFound(_) => ErrorCategory::DeviceNotFound,
            Error::AlreadyInOperation => ErrorCategory::AlreadyInOperation,
            Error::ConnectionTimeout(_) | Error::ConnectionFailed(_) | Error::NotConnected => {
                ErrorCategory::Connection
            }
            Error::OperationTimeout(_) | Error::WriteError(_) => ErrorCategory::Write,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::Bluetooth(_) => ErrorCategory::Other,
            _ => ErrorCategory::Other,
        }
    }
}

/// A recorded error with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
    /// When the error occurred (Unix timestamp millis).
    pub timestamp_ms: u64,
    /// Error message.
    pub message: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Device identifier if applicable.
    pub device_id: Option<String>,
}

/// A recorded phase transition, for reconstructing recent connection
/// history in a diagnostics screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTransition {
    pub timestamp_ms: u64,
    pub from: &'static str,
    pub to: &'static str,
}

/// Write-pipeline outcome counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteStats {
    pub issued: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub rejected: u64,
}

impl WriteStats {
    pub fn success_rate(&self) -> f64 {
        if self.issued == 0 {
            0.0
        } else {
            (self.succeeded as f64 / self.issued as f64) * 100.0
        }
    }
}

/// Connection attempt counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub disconnection_reasons: std::collections::HashMap<String, u64>,
}

impl ConnectionStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            (self.successes as f64 / self.attempts as f64) * 100.0
        }
    }
}

/// Complete diagnostics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothDiagnostics {
    pub connection_stats: ConnectionStats,
    pub write_stats: WriteStats,
    pub consecutive_keepalive_failures: u32,
    pub recent_transitions: Vec<RecordedTransition>,
    pub recent_errors: Vec<RecordedError>,
    pub collected_at: u64,
    pub uptime_secs: u64,
}

/// Collects connection-lifecycle diagnostics over the lifetime of a
/// [`crate::state_machine::StateMachine`].
pub struct DiagnosticsCollector {
    start_time: Instant,
    connection_attempts: AtomicU64,
    connection_successes: AtomicU64,
    connection_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    writes_issued: AtomicU64,
    writes_succeeded: AtomicU64,
    writes_timed_out: AtomicU64,
    writes_rejected: AtomicU64,
    keepalive_failures: AtomicU64,
    disconnection_reasons: RwLock<std::collections::HashMap<String, u64>>,
    recent_transitions: RwLock<VecDeque<RecordedTransition>>,
    recent_errors: RwLock<VecDeque<RecordedError>>,
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connection_attempts: AtomicU64::new(0),
            connection_successes: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_successes: AtomicU64::new(0),
            writes_issued: AtomicU64::new(0),
            writes_succeeded: AtomicU64::new(0),
            writes_timed_out: AtomicU64::new(0),
            writes_rejected: AtomicU64::new(0),
            keepalive_failures: AtomicU64::new(0),
            disconnection_reasons: RwLock::new(std::collections::HashMap::new()),
            recent_transitions: RwLock::new(VecDeque::with_capacity(MAX_RECENT_TRANSITIONS)),
            recent_errors: RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
        }
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_success(&self) {
        self.connection_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_success(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_issued(&self) {
        self.writes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_succeeded(&self) {
        self.writes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_timed_out(&self) {
        self.writes_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_rejected(&self) {
        self.writes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirrors [`crate::keepalive::KeepaliveFailureCounter`]'s running
    /// count; called alongside it rather than replacing it, since the
    /// keepalive loop needs the count synchronously to decide when to log.
    pub fn record_keepalive_failure(&self, consecutive: u32) {
        self.keepalive_failures.store(consecutive as u64, Ordering::Relaxed);
    }

    pub fn record_keepalive_recovered(&self) {
        self.keepalive_failures.store(0, Ordering::Relaxed);
    }

    pub async fn record_disconnection(&self, reason: &DisconnectReason) {
        let reason_str = format!("{:?}", reason);
        let mut reasons = self.disconnection_reasons.write().await;
        *reasons.entry(reason_str).or_insert(0) += 1;
    }

    pub async fn record_transition(&self, from: &'static str, to: &'static str) {
        let recorded = RecordedTransition {
            timestamp_ms: unix_millis(),
            from,
            to,
        };
        let mut transitions = self.recent_transitions.write().await;
        if transitions.len() >= MAX_RECENT_TRANSITIONS {
            transitions.pop_back();
        }
        transitions.push_front(recorded);
    }

    pub async fn record_error(&self, error: &Error, device_id: Option<String>) {
        let recorded = RecordedError {
            timestamp_ms: unix_millis(),
            message: error.to_string(),
            category: ErrorCategory::from(error),
            device_id,
        };
        let mut errors = self.recent_errors.write().await;
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.pop_back();
        }
        errors.push_front(recorded);
    }

    pub async fn collect(&self) -> BluetoothDiagnostics {
        let disconnection_reasons = self.disconnection_reasons.read().await.clone();
        let recent_transitions: Vec<_> = self.recent_transitions.read().await.iter().cloned().collect();
        let recent_errors: Vec<_> = self.recent_errors.read().await.iter().cloned().collect();

        BluetoothDiagnostics {
            connection_stats: ConnectionStats {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                successes: self.connection_successes.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                reconnect_successes: self.reconnect_successes.load(Ordering::Relaxed),
                disconnection_reasons,
            },
            write_stats: WriteStats {
                issued: self.writes_issued.load(Ordering::Relaxed),
                succeeded: self.writes_succeeded.load(Ordering::Relaxed),
                timed_out: self.writes_timed_out.load(Ordering::Relaxed),
                rejected: self.writes_rejected.load(Ordering::Relaxed),
            },
            consecutive_keepalive_failures: self.keepalive_failures.load(Ordering::Relaxed) as u32,
            recent_transitions,
            recent_errors,
            collected_at: unix_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub async fn reset(&self) {
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connection_successes.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.reconnect_successes.store(0, Ordering::Relaxed);
        self.writes_issued.store(0, Ordering::Relaxed);
        self.writes_succeeded.store(0, Ordering::Relaxed);
        self.writes_timed_out.store(0, Ordering::Relaxed);
        self.writes_rejected.store(0, Ordering::Relaxed);
        self.keepalive_failures.store(0, Ordering::Relaxed);
        self.disconnection_reasons.write().await.clear();
        self.recent_transitions.write().await.clear();
        self.recent_errors.write().await.clear();
    }

    /// A summary string suitable for logging.
    pub async fn summary(&self) -> String {
        let diag = self.collect().await;
        format!(
            "Connections: {}/{} ({:.1}% success), Reconnects: {}/{}, \
             Writes: {}/{} ({:.1}% success, {} timed out, {} rejected), \
             Keepalive failures: {}, Errors: {}",
            diag.connection_stats.successes,
            diag.connection_stats.attempts,
            diag.connection_stats.success_rate(),
            diag.connection_stats.reconnect_successes,
            diag.connection_stats.reconnect_attempts,
            diag.write_stats.succeeded,
            diag.write_stats.issued,
            diag.write_stats.success_rate(),
            diag.write_stats.timed_out,
            diag.write_stats.rejected,
            diag.consecutive_keepalive_failures,
            diag.recent_errors.len(),
        )
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Global diagnostics collector instance, for applications that want one
/// process-wide view rather than one per [`crate::state_machine::StateMachine`].
pub static GLOBAL_DIAGNOSTICS: std::sync::LazyLock<Arc<DiagnosticsCollector>> =
    std::sync::LazyLock::new(|| Arc::new(DiagnosticsCollector::new()));

pub fn global_diagnostics() -> &'static Arc<DiagnosticsCollector> {
    &GLOBAL_DIAGNOSTICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_stats_success_rate() {
        let mut stats = ConnectionStats::default();
        assert_eq!(stats.success_rate(), 0.0);
        stats.attempts = 10;
        stats.successes = 8;
        assert!((stats.success_rate() - 80.0).abs() < 0.01);
    }

    #[test]
    fn test_write_stats_success_rate() {
        let mut stats = WriteStats::default();
        stats.issued = 100;
        stats.succeeded = 95;
        assert!((stats.success_rate() - 95.0).abs() < 0.01);
    }

    #[test]
    fn test_error_category_from_error() {
        assert_eq!(
            ErrorCategory::from(&Error::OperationTimeout(Duration::from_secs(1))),
            ErrorCategory::Write
        );
        assert_eq!(ErrorCategory::from(&Error::NotConnected), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::from(&Error::RadioPoweredOff), ErrorCategory::Radio);
    }

    #[tokio::test]
    async fn test_diagnostics_collector_tracks_connections_and_writes() {
        let collector = DiagnosticsCollector::new();
        collector.record_connection_attempt();
        collector.record_connection_success();
        collector.record_write_issued();
        collector.record_write_succeeded();

        let diag = collector.collect().await;
        assert_eq!(diag.connection_stats.attempts, 1);
        assert_eq!(diag.connection_stats.successes, 1);
        assert_eq!(diag.write_stats.issued, 1);
        assert_eq!(diag.write_stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_diagnostics_collector_reset() {
        let collector = DiagnosticsCollector::new();
        collector.record_connection_attempt();
        collector.record_connection_failure();

        let diag = collector.collect().await;
        assert_eq!(diag.connection_stats.failures, 1);

        collector.reset().await;

        let diag = collector.collect().await;
        assert_eq!(diag.connection_stats.failures, 0);
    }

    #[tokio::test]
    async fn test_recent_errors_bounded_and_most_recent_first() {
        let collector = DiagnosticsCollector::new();
        collector.record_error(&Error::NotConnected, Some("dev-1".into())).await;
        collector.record_error(&Error::Cancelled, Some("dev-1".into())).await;

        let diag = collector.collect().await;
        assert_eq!(diag.recent_errors.len(), 2);
        assert_eq!(diag.recent_errors[0].category, ErrorCategory::Cancelled);
    }
}
