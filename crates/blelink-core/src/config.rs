//! Tunable timeouts and thresholds for the connection state machine.

use std::time::Duration;

/// Configuration for a [`crate::state_machine::StateMachine`].
///
/// Defaults match the connection protocol's documented budgets. Use the
/// builder methods to override individual values. This crate keeps a
/// single cross-platform configuration rather than per-OS tuning, since
/// `btleplug` already abstracts the platform difference at the adapter
/// level.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum time in `Connecting` before failing with
    /// [`crate::error::Error::ConnectionTimeout`].
    pub connect_timeout: Duration,
    /// Maximum time across `DiscoveringServices` → `SubscribingToNotifications`.
    pub service_discovery_timeout: Duration,
    /// Same chain on reconnect; suppressed while backgrounded.
    pub auto_reconnect_discovery_timeout: Duration,
    /// Per-write completion wait.
    pub write_timeout: Duration,
    /// Delay between completion of write N and the start of write N+1.
    pub write_pacing_delay: Duration,
    /// Capacity of the bounded data-stream buffer, in chunks.
    pub data_stream_buffer: usize,
    /// Cadence of idle-keepalive RSSI reads.
    pub rssi_keepalive_period: Duration,
    /// Initialization settle window after a transient poweredOff report.
    pub power_off_grace: Duration,
    /// Staleness slack for clock jumps when validating disconnect
    /// callback timestamps.
    pub disconnect_timestamp_tolerance: Duration,
    /// Brief wait for the platform's disconnect acknowledgement during
    /// `disconnect`.
    pub disconnect_ack_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            service_discovery_timeout: Duration::from_secs(40),
            auto_reconnect_discovery_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(5),
            write_pacing_delay: Duration::ZERO,
            data_stream_buffer: 512,
            rssi_keepalive_period: Duration::from_secs(15),
            power_off_grace: Duration::from_millis(1_000),
            disconnect_timestamp_tolerance: Duration::from_millis(1_000),
            disconnect_ack_wait: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Start from the defaults; chain the `with_*` methods to override.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Override `connect_timeout`.
    pub fn with_connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Override `service_discovery_timeout`.
    pub fn with_service_discovery_timeout(mut self, value: Duration) -> Self {
        self.service_discovery_timeout = value;
        self
    }

    /// Override `auto_reconnect_discovery_timeout`.
    pub fn with_auto_reconnect_discovery_timeout(mut self, value: Duration) -> Self {
        self.auto_reconnect_discovery_timeout = value;
        self
    }

    /// Override `write_timeout`.
    pub fn with_write_timeout(mut self, value: Duration) -> Self {
        self.write_timeout = value;
        self
    }

    /// Override `write_pacing_delay`.
    pub fn with_write_pacing_delay(mut self, value: Duration) -> Self {
        self.write_pacing_delay = value;
        self
    }

    /// Override `data_stream_buffer`.
    pub fn with_data_stream_buffer(mut self, chunks: usize) -> Self {
        self.data_stream_buffer = chunks;
        self
    }

    /// Override `rssi_keepalive_period`.
    pub fn with_rssi_keepalive_period(mut self, value: Duration) -> Self {
        self.rssi_keepalive_period = value;
        self
    }
}
