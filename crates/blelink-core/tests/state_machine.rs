//! End-to-end scenarios driving [`StateMachine`] against [`MockRadio`],
//! covering the concrete connection/reconnection/timeout walkthroughs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use blelink_core::{Config, Error, MockRadio, RadioAdapter, StateMachine, UnsolicitedEvent};
use blelink_types::{GattProfile, PeripheralId, PowerState};

fn profile() -> GattProfile {
    GattProfile::nordic_uart()
}

#[tokio::test]
async fn test_cold_connect_happy_path() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    let sm = StateMachine::new(Arc::clone(&radio), profile(), Config::default());
    sm.set_device_id(PeripheralId::new("dev-1"));

    let mut stream = sm.connect().await.expect("connect should succeed");
    assert!(sm.is_connected());
    assert_eq!(sm.current_phase_name().await, "Connected");

    radio.simulate_notification("dev-1", Bytes::from_static(b"hello"));
    let chunk = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("notification should arrive promptly")
        .expect("stream should yield a chunk");
    assert_eq!(chunk, Bytes::from_static(b"hello"));

    sm.disconnect().await;
    assert!(!sm.is_connected());
}

#[tokio::test]
async fn test_stale_disconnect_callback_is_rejected_by_generation_fence() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    let sm = StateMachine::new(Arc::clone(&radio), profile(), Config::default());
    sm.set_device_id(PeripheralId::new("dev-1"));
    sm.connect().await.expect("connect should succeed");

    // An event timestamped well before this generation's connect began
    // must be dropped, not acted on.
    let stale_timestamp = Instant::now() - Duration::from_secs(30);
    radio.simulate_disconnect_event("dev-1", false, stale_timestamp);

    // Give the bridge a moment to deliver and process the (rejected) event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sm.is_connected(), "stale disconnect must not tear down a live connection");
}

#[tokio::test]
async fn test_write_failure_does_not_wedge_the_pipeline() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    let sm = StateMachine::new(Arc::clone(&radio), profile(), Config::default());
    sm.set_device_id(PeripheralId::new("dev-1"));
    sm.connect().await.expect("connect should succeed");

    // Sequence numbers are assigned in submission order starting at 1;
    // script the first write to fail.
    radio.fail_write(1, "simulated write failure");

    let failed = sm.send(Bytes::from_static(b"first")).await;
    assert!(matches!(failed, Err(Error::WriteError(_))));

    // The pipeline must still accept and complete subsequent writes.
    sm.send(Bytes::from_static(b"second")).await.expect("pipeline should recover");
    assert_eq!(sm.write_queue_depth(), 0);
}

/// A [`RadioAdapter`] that delegates everywhere except `discover_services`,
/// which it delays by a fixed duration — used to force the
/// characteristics-discovery subchain to still be in flight when a
/// phase timeout is armed.
struct SlowDiscoveryRadio {
    inner: MockRadio,
    delay: Duration,
}

#[async_trait]
impl RadioAdapter for SlowDiscoveryRadio {
    type Peripheral = <MockRadio as RadioAdapter>::Peripheral;

    async fn power_state(&self) -> blelink_core::Result<PowerState> {
        self.inner.power_state().await
    }
    async fn peripheral(&self, id: &PeripheralId) -> blelink_core::Result<Option<Self::Peripheral>> {
        self.inner.peripheral(id).await
    }
    async fn connect(&self, peripheral: &Self::Peripheral) -> blelink_core::Result<()> {
        self.inner.connect(peripheral).await
    }
    async fn cancel_connect(&self, peripheral: &Self::Peripheral) -> blelink_core::Result<()> {
        self.inner.cancel_connect(peripheral).await
    }
    async fn is_connected(&self, peripheral: &Self::Peripheral) -> blelink_core::Result<bool> {
        self.inner.is_connected(peripheral).await
    }
    async fn discover_services(&self, peripheral: &Self::Peripheral, profile: &GattProfile) -> blelink_core::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.discover_services(peripheral, profile).await
    }
    async fn discover_characteristics(&self, peripheral: &Self::Peripheral, profile: &GattProfile) -> blelink_core::Result<()> {
        self.inner.discover_characteristics(peripheral, profile).await
    }
    async fn subscribe(&self, peripheral: &Self::Peripheral, profile: &GattProfile) -> blelink_core::Result<()> {
        self.inner.subscribe(peripheral, profile).await
    }
    async fn write(&self, peripheral: &Self::Peripheral, profile: &GattProfile, sequence: u64, bytes: Bytes) -> blelink_core::Result<()> {
        self.inner.write(peripheral, profile, sequence, bytes).await
    }
    async fn read_rssi(&self, peripheral: &Self::Peripheral) -> blelink_core::Result<i16> {
        self.inner.read_rssi(peripheral).await
    }
    async fn start_scan(&self, profile: &GattProfile) -> blelink_core::Result<()> {
        self.inner.start_scan(profile).await
    }
    async fn stop_scan(&self) -> blelink_core::Result<()> {
        self.inner.stop_scan().await
    }
    async fn connected_peripherals(&self) -> blelink_core::Result<Vec<Self::Peripheral>> {
        self.inner.connected_peripherals().await
    }
    fn take_events(&self) -> mpsc::UnboundedReceiver<UnsolicitedEvent<Self::Peripheral>> {
        self.inner.take_events()
    }
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_discovery_timeout_suppressed_while_backgrounded() {
    let inner = MockRadio::new();
    inner.register("dev-1");
    let radio = Arc::new(SlowDiscoveryRadio {
        inner,
        delay: Duration::from_secs(30),
    });
    let config = Config::builder().with_auto_reconnect_discovery_timeout(Duration::from_secs(5));
    let sm = StateMachine::new(Arc::clone(&radio), profile(), config);
    sm.set_device_id(PeripheralId::new("dev-1"));
    sm.connect().await.expect("initial connect should succeed");

    sm.app_did_enter_background();
    radio.inner.simulate_disconnect_event("dev-1", true, Instant::now());
    // Let the rediscovery chain start and the (backgrounded) timeout fire.
    // `connect` itself resolves immediately (only `discover_services` is
    // slow), so the chain has already advanced past `Connecting` into
    // `DiscoveringServices` well before this sleep elapses.
    tokio::time::sleep(Duration::from_secs(10)).await;

    // The timeout is suppressed while backgrounded (generation-fenced and
    // foreground-gated), so the reconnect attempt must still be in flight
    // rather than cancelled outright.
    assert_eq!(sm.current_phase_name().await, "DiscoveringServices");

    // Once the slow discovery eventually completes, the connection
    // recovers rather than having been torn down by the suppressed
    // timeout.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(sm.current_phase_name().await, "Connected");
}

#[tokio::test]
async fn test_power_off_grace_resolves_connect_once_radio_recovers() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    radio.set_power(PowerState::PoweredOff);
    let config = Config {
        power_off_grace: Duration::from_secs(2),
        ..Config::default()
    };
    let sm = StateMachine::new(Arc::clone(&radio), profile(), config);
    sm.set_device_id(PeripheralId::new("dev-1"));

    let connect_attempts = Arc::new(AtomicUsize::new(0));
    let radio_for_task = Arc::clone(&radio);
    let attempts = Arc::clone(&connect_attempts);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        attempts.fetch_add(1, Ordering::SeqCst);
        radio_for_task.transition_power(PowerState::PoweredOn);
    });

    let result = tokio::time::timeout(Duration::from_secs(5), sm.connect()).await;
    assert!(result.is_ok(), "connect should resolve once the radio recovers within the grace window");
    assert!(result.unwrap().is_ok());
    assert_eq!(connect_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_switch_device_while_connected_reconnects_to_the_new_id() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    radio.register("dev-2");
    let sm = StateMachine::new(Arc::clone(&radio), profile(), Config::default());
    sm.set_device_id(PeripheralId::new("dev-1"));
    sm.connect().await.expect("connect to dev-1 should succeed");
    assert_eq!(sm.connected_device_id(), Some(PeripheralId::new("dev-1")));

    sm.switch_device(PeripheralId::new("dev-2")).await.expect("switch should succeed");
    assert_eq!(sm.connected_device_id(), Some(PeripheralId::new("dev-2")));

    // Connecting again to the device already live is a no-op, not an error.
    let again = sm.connect().await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_connect_to_different_device_while_connected_is_already_in_operation() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    radio.register("dev-2");
    let sm = StateMachine::new(Arc::clone(&radio), profile(), Config::default());
    sm.set_device_id(PeripheralId::new("dev-1"));
    sm.connect().await.expect("connect to dev-1 should succeed");

    // Pointing the facade at a different id without going through
    // `switch_device` must be rejected rather than silently reconnecting.
    sm.set_device_id(PeripheralId::new("dev-2"));
    let result = sm.connect().await;
    assert!(matches!(result, Err(Error::AlreadyInOperation)));
    assert_eq!(sm.current_phase_name().await, "Connected");
    assert_eq!(sm.connected_device_id(), Some(PeripheralId::new("dev-1")));
}

#[tokio::test]
async fn test_reconnect_after_disconnect_yields_a_second_distinct_stream() {
    let radio = Arc::new(MockRadio::new());
    radio.register("dev-1");
    let sm = StateMachine::new(Arc::clone(&radio), profile(), Config::default());
    sm.set_device_id(PeripheralId::new("dev-1"));

    let mut first = sm.connect().await.expect("first connect should succeed");
    sm.disconnect().await;
    // The first stream's producer was dropped on disconnect, finalizing it
    // before the second connect begins.
    assert_eq!(first.next().await, None);

    let mut second = sm.connect().await.expect("second connect should succeed");
    radio.simulate_notification("dev-1", Bytes::from_static(b"again"));
    let chunk = tokio::time::timeout(Duration::from_secs(1), second.next())
        .await
        .expect("notification should arrive on the new stream")
        .expect("stream should yield a chunk");
    assert_eq!(chunk, Bytes::from_static(b"again"));
}
