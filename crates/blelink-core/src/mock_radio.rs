//! A scriptable [`RadioAdapter`] for driving the state machine in tests
//! without real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use blelink_types::{GattProfile, PeripheralId, PowerState};

use crate::error::{Error, Result};
use crate::phase::BlePeripheral;
use crate::radio::{RadioAdapter, UnsolicitedEvent};

/// A mock peripheral handle; identity-only, since the mock radio keeps
/// all simulated GATT state keyed by [`PeripheralId`] internally.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    id: PeripheralId,
}

impl BlePeripheral for MockPeripheral {
    fn id(&self) -> PeripheralId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Default)]
struct ScriptedDevice {
    services_present: bool,
    characteristics_present: bool,
    connect_fails: bool,
    subscribe_fails: bool,
}

/// A scriptable radio adapter.
///
/// Register known devices with [`MockRadio::register`], then tune
/// per-device failure injection with [`MockRadio::fail_connect`] /
/// [`MockRadio::fail_subscribe`] before driving the state machine.
pub struct MockRadio {
    power: RwLock<PowerState>,
    devices: RwLock<HashMap<String, ScriptedDevice>>,
    connected: RwLock<std::collections::HashSet<String>>,
    rssi: AtomicI16,
    scanning: AtomicBool,
    write_results: Mutex<HashMap<u64, std::result::Result<(), String>>>,
    events_tx: mpsc::UnboundedSender<UnsolicitedEvent<MockPeripheral>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<UnsolicitedEvent<MockPeripheral>>>>,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    /// A radio starting `poweredOn` with no registered devices.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            power: RwLock::new(PowerState::PoweredOn),
            devices: RwLock::new(HashMap::new()),
            connected: RwLock::new(std::collections::HashSet::new()),
            rssi: AtomicI16::new(-40),
            scanning: AtomicBool::new(false),
            write_results: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Register a device, fully provisioned with services and
    /// characteristics by default.
    pub fn register(&self, id: &str) {
        self.devices.write().unwrap().insert(
            id.to_string(),
            ScriptedDevice {
                services_present: true,
                characteristics_present: true,
                connect_fails: false,
                subscribe_fails: false,
            },
        );
    }

    /// Set the simulated power state without emitting an event. Use this
    /// to establish the radio's state before the state machine observes
    /// it (e.g. in test setup); use [`Self::transition_power`] to simulate
    /// a live state-change callback.
    pub fn set_power(&self, state: PowerState) {
        *self.power.write().unwrap() = state;
    }

    /// Simulate the platform reporting a power-state transition while the
    /// state machine is running.
    pub fn transition_power(&self, state: PowerState) {
        *self.power.write().unwrap() = state;
        let _ = self.events_tx.send(UnsolicitedEvent::PowerStateChanged(state));
    }

    /// Inject a connect failure for `id`.
    pub fn fail_connect(&self, id: &str, fails: bool) {
        if let Some(dev) = self.devices.write().unwrap().get_mut(id) {
            dev.connect_fails = fails;
        }
    }

    /// Inject a subscribe failure for `id`.
    pub fn fail_subscribe(&self, id: &str, fails: bool) {
        if let Some(dev) = self.devices.write().unwrap().get_mut(id) {
            dev.subscribe_fails = fails;
        }
    }

    /// Simulate the platform disconnecting `id` out from under us, without
    /// emitting an unsolicited event (used by tests that only care about
    /// the platform-reported connection state, e.g. `is_connected`).
    pub fn simulate_disconnect(&self, id: &str) {
        self.connected.write().unwrap().remove(id);
    }

    /// Simulate an unsolicited `didDisconnect` callback for `id`, carrying
    /// the given reconnect flag and event timestamp (exposed so tests can
    /// construct stale-callback scenarios per the generation fence).
    pub fn simulate_disconnect_event(&self, id: &str, is_reconnecting: bool, event_timestamp: Instant) {
        self.connected.write().unwrap().remove(id);
        let _ = self.events_tx.send(UnsolicitedEvent::Disconnected {
            peripheral: MockPeripheral {
                id: PeripheralId::new(id),
            },
            is_reconnecting,
            event_timestamp,
        });
    }

    /// Simulate an inbound RX notification for `id`.
    pub fn simulate_notification(&self, id: &str, bytes: Bytes) {
        let _ = self.events_tx.send(UnsolicitedEvent::Notification {
            peripheral: MockPeripheral {
                id: PeripheralId::new(id),
            },
            bytes,
        });
    }

    /// Simulate the OS handing back a peripheral connected in a previous
    /// process launch.
    pub fn simulate_restore_state(&self, id: &str) {
        let _ = self.events_tx.send(UnsolicitedEvent::WillRestoreState {
            peripheral: MockPeripheral {
                id: PeripheralId::new(id),
            },
        });
    }

    /// Simulate a scan-result delivery for `id` at the given RSSI.
    pub fn simulate_discovery(&self, id: &str, rssi: i16) {
        let _ = self.events_tx.send(UnsolicitedEvent::Discovered {
            id: PeripheralId::new(id),
            rssi,
        });
    }

    /// Set the RSSI value returned by `read_rssi`.
    pub fn set_rssi(&self, rssi: i16) {
        self.rssi.store(rssi, Ordering::SeqCst);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Script the next write at `sequence` to fail with `message`.
    pub fn fail_write(&self, sequence: u64, message: &str) {
        self.write_results
            .lock()
            .unwrap()
            .insert(sequence, Err(message.to_string()));
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    type Peripheral = MockPeripheral;

    async fn power_state(&self) -> Result<PowerState> {
        Ok(*self.power.read().unwrap())
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Option<Self::Peripheral>> {
        let devices = self.devices.read().unwrap();
        Ok(devices
            .contains_key(id.as_str())
            .then(|| MockPeripheral { id: id.clone() }))
    }

    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<()> {
        let connect_fails = {
            let devices = self.devices.read().unwrap();
            let dev = devices
                .get(peripheral.id.as_str())
                .ok_or_else(|| Error::DeviceNotFound(peripheral.id.clone()))?;
            dev.connect_fails
        };
        if connect_fails {
            return Err(Error::ConnectionFailed("mock connect failure".into()));
        }
        self.connected
            .write()
            .unwrap()
            .insert(peripheral.id.as_str().to_string());
        Ok(())
    }

    async fn cancel_connect(&self, peripheral: &Self::Peripheral) -> Result<()> {
        self.connected.write().unwrap().remove(peripheral.id.as_str());
        Ok(())
    }

    async fn is_connected(&self, peripheral: &Self::Peripheral) -> Result<bool> {
        Ok(self.connected.read().unwrap().contains(peripheral.id.as_str()))
    }

    async fn discover_services(&self, peripheral: &Self::Peripheral, _profile: &GattProfile) -> Result<()> {
        let devices = self.devices.read().unwrap();
        let dev = devices
            .get(peripheral.id.as_str())
            .ok_or_else(|| Error::DeviceNotFound(peripheral.id.clone()))?;
        if !dev.services_present {
            return Err(Error::ConnectionFailed("service not present".into()));
        }
        Ok(())
    }

    async fn discover_characteristics(&self, peripheral: &Self::Peripheral, _profile: &GattProfile) -> Result<()> {
        let devices = self.devices.read().unwrap();
        let dev = devices
            .get(peripheral.id.as_str())
            .ok_or_else(|| Error::DeviceNotFound(peripheral.id.clone()))?;
        if !dev.characteristics_present {
            return Err(Error::ConnectionFailed("characteristics not present".into()));
        }
        Ok(())
    }

    async fn subscribe(&self, peripheral: &Self::Peripheral, _profile: &GattProfile) -> Result<()> {
        let devices = self.devices.read().unwrap();
        let dev = devices
            .get(peripheral.id.as_str())
            .ok_or_else(|| Error::DeviceNotFound(peripheral.id.clone()))?;
        if dev.subscribe_fails {
            return Err(Error::ConnectionFailed("mock subscribe failure".into()));
        }
        Ok(())
    }

    async fn write(&self, _peripheral: &Self::Peripheral, _profile: &GattProfile, sequence: u64, _bytes: Bytes) -> Result<()> {
        let override_result = self.write_results.lock().unwrap().remove(&sequence);
        if let Some(Err(msg)) = override_result {
            return Err(Error::WriteError(msg));
        }
        Ok(())
    }

    async fn read_rssi(&self, _peripheral: &Self::Peripheral) -> Result<i16> {
        Ok(self.rssi.load(Ordering::SeqCst))
    }

    async fn start_scan(&self, _profile: &GattProfile) -> Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connected_peripherals(&self) -> Result<Vec<Self::Peripheral>> {
        Ok(self
            .connected
            .read()
            .unwrap()
            .iter()
            .map(|id| MockPeripheral {
                id: PeripheralId::new(id.clone()),
            })
            .collect())
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<UnsolicitedEvent<Self::Peripheral>> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("MockRadio::take_events called more than once")
    }
}

/// A thread-safe, cloneable handle to a [`MockRadio`], for tests that need
/// to script the radio from outside the state machine while it runs.
pub type SharedMockRadio = Arc<MockRadio>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_device_not_found() {
        let radio = MockRadio::new();
        assert!(radio.peripheral(&PeripheralId::new("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registered_device_connects() {
        let radio = MockRadio::new();
        radio.register("dev-1");
        let p = radio
            .peripheral(&PeripheralId::new("dev-1"))
            .await
            .unwrap()
            .unwrap();
        radio.connect(&p).await.unwrap();
        assert!(radio.is_connected(&p).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let radio = MockRadio::new();
        radio.register("dev-1");
        radio.fail_connect("dev-1", true);
        let p = radio
            .peripheral(&PeripheralId::new("dev-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(radio.connect(&p).await.is_err());
    }

    #[tokio::test]
    async fn test_simulate_disconnect() {
        let radio = MockRadio::new();
        radio.register("dev-1");
        let p = radio
            .peripheral(&PeripheralId::new("dev-1"))
            .await
            .unwrap()
            .unwrap();
        radio.connect(&p).await.unwrap();
        radio.simulate_disconnect("dev-1");
        assert!(!radio.is_connected(&p).await.unwrap());
    }

    #[tokio::test]
    async fn test_simulate_disconnect_event_delivers_on_event_channel() {
        let radio = MockRadio::new();
        radio.register("dev-1");
        let mut events = radio.take_events();
        radio.simulate_disconnect_event("dev-1", true, Instant::now());
        match events.recv().await.unwrap() {
            UnsolicitedEvent::Disconnected {
                peripheral,
                is_reconnecting,
                ..
            } => {
                assert_eq!(peripheral.id.as_str(), "dev-1");
                assert!(is_reconnecting);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_take_events_twice_panics() {
        let radio = MockRadio::new();
        let _ = radio.take_events();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| radio.take_events()));
        assert!(result.is_err());
    }
}
