//! Error types for the blelink connection state machine.

use std::time::Duration;

use thiserror::Error;

use blelink_types::PeripheralId;

/// Errors surfaced by the connection state machine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants in
/// future versions without breaking downstream code. Every variant maps to
/// one of the error kinds in the taxonomy; no error is recovered silently
/// inside the core, with two documented exceptions: RSSI keepalive
/// failures are counted and logged but never surfaced, and unexpected
/// callbacks (wrong phase, wrong peripheral) are logged and dropped rather
/// than erroring.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The platform reports BLE as unsupported. Permanent for the process;
    /// do not retry.
    #[error("Bluetooth is unsupported on this platform")]
    RadioUnavailable,

    /// The application was denied the Bluetooth permission. Do not retry
    /// without new permission.
    #[error("Bluetooth permission was denied")]
    RadioUnauthorized,

    /// The radio reports powered-off and the power-off grace window
    /// elapsed without a poweredOn transition. Retry once the radio
    /// returns to poweredOn.
    #[error("Bluetooth is powered off")]
    RadioPoweredOff,

    /// The peripheral identifier could not be retrieved from the
    /// platform's peripheral cache.
    #[error("device not found: {0}")]
    DeviceNotFound(PeripheralId),

    /// `connect` or `switch_device` was requested while the state machine
    /// was not `Idle`. Non-retryable without an intervening disconnect.
    #[error("a connection operation is already in progress")]
    AlreadyInOperation,

    /// The current phase exceeded its connect-timeout budget. Retry
    /// permitted.
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// A write exceeded its timeout budget. Retry permitted.
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// The platform delivered a `didFailToConnect` or an in-phase
    /// discovery error. Retry permitted after a short backoff.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// `send` was attempted outside the `Connected` phase, or a write
    /// waiter woke into a non-`Connected` phase. Retry after reconnect.
    #[error("not connected")]
    NotConnected,

    /// The platform reported an error on write completion. Retry at the
    /// caller's discretion.
    #[error("write failed: {0}")]
    WriteError(String),

    /// `shutdown` or the caller's own context cancelled the operation. Do
    /// not retry.
    #[error("operation was cancelled")]
    Cancelled,

    /// The underlying platform BLE driver returned an error not covered by
    /// a more specific variant above.
    #[error("BLE driver error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

impl Error {
    /// Whether retrying the same operation immediately could plausibly
    /// succeed, per the error taxonomy in the design notes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RadioPoweredOff
                | Error::ConnectionTimeout(_)
                | Error::OperationTimeout(_)
                | Error::ConnectionFailed(_)
                | Error::NotConnected
                | Error::WriteError(_)
        )
    }
}

/// Result type alias using this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
