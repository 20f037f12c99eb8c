//! Connection events for diagnostics and logging.
//!
//! Distinct from the disconnection/reconnection handler closures the
//! facade registers via `set_disconnection_handler`/`set_reconnection_handler`:
//! those drive application behavior directly, while [`ConnectionEvent`] is a
//! serializable record broadcast for observers (diagnostics UI, logging
//! sinks) that want a uniform, replayable event stream.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use blelink_types::PeripheralId;

/// Events emitted as the connection lifecycle progresses.
///
/// Marked `#[non_exhaustive]` to allow adding event types without breaking
/// downstream matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// A peripheral was seen while scanning.
    Discovered { device: PeripheralId, rssi: i16 },
    /// `connect` entered `Connecting`.
    ConnectionStarted { device: PeripheralId },
    /// The connection setup protocol reached `Connected`.
    Connected { device: PeripheralId },
    /// The connection was lost, with the recorded disconnect reason.
    Disconnected {
        device: PeripheralId,
        reason: DisconnectReason,
    },
    /// Auto-reconnect discovery began after a transient disconnect.
    ReconnectStarted { device: PeripheralId },
    /// Auto-reconnect (or restoration) completed successfully.
    ReconnectSucceeded { device: PeripheralId },
    /// An operation failed; carries a human-readable description.
    Error { device: PeripheralId, message: String },
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// `disconnect` or `shutdown` was called.
    Requested,
    /// The platform reported a non-reconnecting disconnect.
    PlatformDisconnect,
    /// A phase's timeout budget was exceeded.
    Timeout,
    /// The radio reported powered-off.
    RadioPoweredOff,
    /// A BLE driver error occurred.
    BleError(String),
}

/// Sender for connection events.
pub type EventSender = broadcast::Sender<ConnectionEvent>;
/// Receiver for connection events.
pub type EventReceiver = broadcast::Receiver<ConnectionEvent>;

/// Broadcasts [`ConnectionEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a dispatcher buffering up to `capacity` events per lagging
    /// subscriber before it starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event. Silently dropped if there are no subscribers.
    pub fn send(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of currently-subscribed receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();
        dispatcher.send(ConnectionEvent::Connected {
            device: PeripheralId::new("dev-1"),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::Connected { .. }));
    }

    #[test]
    fn test_send_with_no_subscribers_does_not_panic() {
        let dispatcher = EventDispatcher::new(16);
        dispatcher.send(ConnectionEvent::Discovered {
            device: PeripheralId::new("dev-1"),
            rssi: -60,
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_serializes_to_tagged_json() {
        let event = ConnectionEvent::Disconnected {
            device: PeripheralId::new("dev-1"),
            reason: DisconnectReason::Timeout,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"disconnected\""));
    }
}
