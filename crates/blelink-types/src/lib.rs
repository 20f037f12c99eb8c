//! Platform-agnostic types for the blelink BLE central-role transport.
//!
//! This crate provides the identifiers and on-wire constants shared by
//! `blelink-core`'s connection state machine and any consumer of its
//! facade. It has no BLE or async-runtime dependency: everything here is
//! plain data.
//!
//! # Contents
//!
//! - [`ids::PeripheralId`] — an opaque, platform-stable peripheral identity.
//! - [`power::PowerState`] — the Bluetooth radio's reported power state.
//! - [`uuid`] — the Nordic UART Service UUID and its two characteristics.

pub mod ids;
pub mod power;
pub mod uuid;

pub use ids::PeripheralId;
pub use power::PowerState;
pub use uuid::GattProfile;
