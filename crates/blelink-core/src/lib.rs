//! Core BLE central-role connection state machine for Nordic UART Service
//! (NUS) peripherals.
//!
//! This crate owns the connection lifecycle for a single peripheral at a
//! time: scanning, connect, GATT service/characteristic discovery,
//! notification subscription, a serialized write pipeline, RSSI-based
//! keepalive, and auto-reconnect with OS state restoration. It does not
//! know anything about what bytes flow over the UART characteristics —
//! that is the concern of whatever protocol is layered on top of
//! [`Transport`].
//!
//! # Platform differences
//!
//! [`BtleplugRadio`] is a thin [`RadioAdapter`] implementation over the
//! `btleplug` crate, which already abstracts CoreBluetooth (macOS/iOS),
//! BlueZ (Linux), and WinRT (Windows). Peripheral identity
//! ([`PeripheralId`]) is whatever `btleplug` reports for the platform —
//! a CoreBluetooth-assigned UUID on macOS, a MAC address on Linux and
//! Windows — and is not guaranteed stable across a Bluetooth stack reset
//! on any platform.
//!
//! # Quick start
//!
//! ```no_run
//! use blelink_core::{Config, Transport};
//!
//! #[tokio::main]
//! async fn main() -> blelink_core::Result<()> {
//!     let transport = Transport::new(Config::default()).await?;
//!     transport.set_device_id("AA:BB:CC:DD:EE:FF");
//!     let mut stream = transport.connect().await?;
//!     transport.send(&b"hello"[..]).await?;
//!     // `stream` yields inbound notification bytes in arrival order.
//!     let _ = stream;
//!     Ok(())
//! }
//! ```
//!
//! # Choosing an entrypoint
//!
//! | Type | Use case |
//! |------|----------|
//! | [`Transport`] | The facade (§6.1): connect/send/disconnect/switch for a host application |
//! | [`StateMachine`] | The full surface, for diagnostics, scanning, and foreground/background hooks that sit "below" the facade |
//! | [`MockRadio`] | A scriptable [`RadioAdapter`] for driving either of the above in tests without hardware |

pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod facade;
pub mod generation;
pub mod keepalive;
pub mod metrics;
pub mod mock_radio;
pub mod phase;
pub mod radio;
pub mod scan;
pub mod state_machine;
pub mod streaming;
pub mod util;
pub mod write_pipeline;

pub use blelink_types::{GattProfile, PeripheralId, PowerState};

pub use config::Config;
pub use diagnostics::{
    BluetoothDiagnostics, ConnectionStats, DiagnosticsCollector, ErrorCategory, RecordedError,
    RecordedTransition, WriteStats, global_diagnostics,
};
pub use error::{Error, Result};
pub use events::{ConnectionEvent, DisconnectReason, EventReceiver};
pub use facade::Transport;
pub use metrics::{ConnectionMetrics, ConnectionMetricsSummary, OperationMetrics};
pub use mock_radio::{MockPeripheral, MockRadio, SharedMockRadio};
pub use radio::{BtleplugRadio, RadioAdapter, RadioPeripheral, UnsolicitedEvent};
pub use scan::DiscoveryCallback;
pub use state_machine::{DisconnectionHandler, ReconnectionHandler, StateMachine};
pub use streaming::{DataProducer, DataStream};
