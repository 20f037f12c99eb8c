//! Bluetooth UUIDs for the Nordic UART Service (NUS).
//!
//! These are the only link-layer constants the connection state machine
//! depends on: one service and its two characteristics. They are `const`
//! so tests can swap in alternate UUIDs by constructing their own
//! [`GattProfile`] rather than patching these values.

use uuid::{Uuid, uuid};

/// Nordic UART Service UUID.
pub const NUS_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// TX characteristic (write-with-response target; the peripheral receives).
pub const NUS_TX_CHARACTERISTIC: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// RX characteristic (notify source; the peripheral transmits).
pub const NUS_RX_CHARACTERISTIC: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// The service and characteristic UUIDs a connection targets.
///
/// Fixed at runtime but configurable in tests, per the on-wire constants
/// contract: production code always uses [`GattProfile::nordic_uart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Primary service UUID to filter discovery to.
    pub service: Uuid,
    /// Write-target characteristic UUID.
    pub tx: Uuid,
    /// Notify-source characteristic UUID.
    pub rx: Uuid,
}

impl GattProfile {
    /// The standard Nordic UART Service profile.
    pub const fn nordic_uart() -> Self {
        Self {
            service: NUS_SERVICE,
            tx: NUS_TX_CHARACTERISTIC,
            rx: NUS_RX_CHARACTERISTIC,
        }
    }
}

impl Default for GattProfile {
    fn default() -> Self {
        Self::nordic_uart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nus_service_uuid() {
        assert_eq!(
            NUS_SERVICE.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_nus_tx_uuid() {
        assert_eq!(
            NUS_TX_CHARACTERISTIC.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_nus_rx_uuid() {
        assert_eq!(
            NUS_RX_CHARACTERISTIC.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_uuids_are_distinct() {
        assert_ne!(NUS_SERVICE, NUS_TX_CHARACTERISTIC);
        assert_ne!(NUS_TX_CHARACTERISTIC, NUS_RX_CHARACTERISTIC);
        assert_ne!(NUS_SERVICE, NUS_RX_CHARACTERISTIC);
    }

    #[test]
    fn test_default_profile_is_nordic_uart() {
        let profile = GattProfile::default();
        assert_eq!(profile, GattProfile::nordic_uart());
        assert_eq!(profile.service, NUS_SERVICE);
        assert_eq!(profile.tx, NUS_TX_CHARACTERISTIC);
        assert_eq!(profile.rx, NUS_RX_CHARACTERISTIC);
    }
}
