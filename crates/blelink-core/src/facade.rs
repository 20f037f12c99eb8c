//! The transport facade (§6.1): the minimal public surface the upper mesh
//! layer is expected to drive. Everything here forwards to
//! [`StateMachine`]; the operations §6.2 lists as "below the facade" (scan
//! controls, foreground/background hooks, diagnostics) are reached by
//! going through [`Transport::state_machine`] directly.

use std::sync::Arc;

use bytes::Bytes;

use blelink_types::{GattProfile, PeripheralId};

use crate::config::Config;
use crate::error::Result;
use crate::radio::{BtleplugRadio, RadioAdapter};
use crate::state_machine::{DisconnectionHandler, ReconnectionHandler, StateMachine};
use crate::streaming::DataStream;

/// The connection state machine, presented as the narrow surface a mesh
/// client needs: connect, disconnect, send, receive, switch, and the
/// connected device id.
///
/// Generic over [`RadioAdapter`] so tests can build a `Transport<MockRadio>`
/// without touching real hardware; [`Transport::new`] wires up the
/// production `btleplug` backed adapter.
pub struct Transport<R: RadioAdapter = BtleplugRadio> {
    sm: Arc<StateMachine<R>>,
}

impl Transport<BtleplugRadio> {
    /// Build a facade backed by the first available platform Bluetooth
    /// adapter, targeting the Nordic UART service.
    pub async fn new(config: Config) -> Result<Self> {
        let radio = Arc::new(BtleplugRadio::first_available().await?);
        Ok(Self::with_radio(radio, GattProfile::nordic_uart(), config))
    }
}

impl<R: RadioAdapter + 'static> Transport<R> {
    /// Build a facade over an arbitrary [`RadioAdapter`] (production or
    /// mock) and GATT profile. Prefer [`Transport::new`] in application
    /// code; this constructor exists for tests and for callers that target
    /// a non-standard UART-style profile.
    pub fn with_radio(radio: Arc<R>, profile: GattProfile, config: Config) -> Self {
        Self {
            sm: StateMachine::new(radio, profile, config),
        }
    }

    /// The underlying state machine, for operations §6.2 lists as
    /// "below the facade" (scanning, diagnostics, foreground/background
    /// hooks) that this facade intentionally does not forward.
    pub fn state_machine(&self) -> &Arc<StateMachine<R>> {
        &self.sm
    }

    /// Set the stable peripheral identifier `connect` and `switch_device`
    /// operate on.
    pub fn set_device_id(&self, id: impl Into<PeripheralId>) {
        self.sm.set_device_id(id.into());
    }

    /// Register the handler invoked once per disconnection — caller-
    /// requested or platform-driven, successful or not. `error` is `None`
    /// for a caller-requested disconnect or shutdown.
    pub fn set_disconnection_handler(&self, handler: DisconnectionHandler) {
        self.sm.set_disconnection_handler(handler);
    }

    /// Register the handler invoked when auto-reconnect or OS state
    /// restoration produces a fresh `Connected` phase. The new data stream
    /// must be captured before the handler returns: it is not delivered
    /// any other way.
    pub fn set_reconnection_handler(&self, handler: ReconnectionHandler) {
        self.sm.set_reconnection_handler(handler);
    }

    /// Connect to the previously-set device id, waiting out the full
    /// connection setup protocol (§4.5) before returning.
    ///
    /// Connecting to the device already Connected returns immediately
    /// without error; connecting to a different device while not `Idle`
    /// fails with [`crate::error::Error::AlreadyInOperation`] — use
    /// [`Transport::switch_device`] instead.
    pub async fn connect(&self) -> Result<DataStream> {
        self.sm.connect().await
    }

    /// Disconnect the current connection, if any. Always completes,
    /// regardless of prior state.
    pub async fn disconnect(&self) {
        self.sm.disconnect().await;
    }

    /// Disconnect the current connection (if any) and connect to
    /// `new_id`.
    pub async fn switch_device(&self, new_id: impl Into<PeripheralId>) -> Result<DataStream> {
        self.sm.switch_device(new_id.into()).await
    }

    /// Send `bytes` over the write pipeline (§4.3). Queues FIFO behind any
    /// write already in flight.
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.sm.send(bytes.into()).await
    }

    /// Whether the facade currently considers itself connected.
    pub fn is_connected(&self) -> bool {
        self.sm.is_connected()
    }

    /// The currently-connected device id, if any.
    pub fn connected_device_id(&self) -> Option<PeripheralId> {
        self.sm.connected_device_id()
    }

    /// The consumer end of the current data stream. Returns an already-
    /// closed stream if not connected, per the facade contract — callers
    /// should prefer capturing the stream returned by [`Transport::connect`]
    /// or delivered to the reconnection handler; this exists for callers
    /// that lost their handle.
    pub fn received_data(&self) -> DataStream {
        self.sm.received_data()
    }

    /// Idempotent teardown: stop scanning, cancel every outstanding timer,
    /// resume every pending completion and write waiter with a
    /// cancellation error, and transition to `Idle`.
    pub async fn shutdown(&self) {
        self.sm.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::error::Error;
    use crate::mock_radio::MockRadio;

    fn transport() -> (Transport<MockRadio>, Arc<MockRadio>) {
        let radio = Arc::new(MockRadio::new());
        radio.register("dev-1");
        let transport = Transport::with_radio(Arc::clone(&radio), GattProfile::nordic_uart(), Config::default());
        (transport, radio)
    }

    #[tokio::test]
    async fn test_connect_send_receive_round_trip() {
        let (transport, radio) = transport();
        transport.set_device_id("dev-1");
        let mut stream = transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.connected_device_id(), Some(PeripheralId::new("dev-1")));

        transport.send(Bytes::from_static(b"hello")).await.unwrap();

        radio.simulate_notification("dev-1", Bytes::from_static(b"world"));
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"world")));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_device_fails_with_device_not_found() {
        let (transport, _radio) = transport();
        transport.set_device_id("does-not-exist");
        let result = transport.connect().await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_connect_to_same_connected_device_is_idempotent() {
        let (transport, _radio) = transport();
        transport.set_device_id("dev-1");
        let _first = transport.connect().await.unwrap();
        let second = transport.connect().await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_switch_device_while_connected_reconnects_to_new_id() {
        let (transport, radio) = transport();
        radio.register("dev-2");
        transport.set_device_id("dev-1");
        transport.connect().await.unwrap();

        transport.switch_device("dev-2").await.unwrap();
        assert_eq!(transport.connected_device_id(), Some(PeripheralId::new("dev-2")));
    }

    #[tokio::test]
    async fn test_reconnection_handler_invoked_with_new_stream_on_auto_reconnect() {
        let (transport, radio) = transport();
        transport.set_device_id("dev-1");
        transport.connect().await.unwrap();

        let got_stream = Arc::new(AtomicUsize::new(0));
        let got_stream_clone = Arc::clone(&got_stream);
        transport.set_reconnection_handler(Box::new(move |_id, _stream| {
            got_stream_clone.fetch_add(1, Ordering::SeqCst);
        }));

        radio.simulate_disconnect_event("dev-1", true, std::time::Instant::now());
        // Give the reconnect-discovery task a chance to run to completion.
        for _ in 0..50 {
            if got_stream.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(got_stream.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_invokes_disconnection_handler_and_is_safe_to_repeat() {
        let (transport, _radio) = transport();
        transport.set_device_id("dev-1");
        transport.connect().await.unwrap();

        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = Arc::clone(&called);
        transport.set_disconnection_handler(Box::new(move |_id, err| {
            assert!(err.is_none());
            called_clone.fetch_add(1, Ordering::SeqCst);
        }));

        transport.shutdown().await;
        assert!(!transport.is_connected());
        transport.shutdown().await;
        assert!(called.load(Ordering::SeqCst) >= 1);
        assert!(!transport.is_connected());
    }
}
