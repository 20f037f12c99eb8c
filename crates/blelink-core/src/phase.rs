//! The phase machine modeling the connection lifecycle.
//!
//! Each [`Phase`] variant owns exactly the resources documented on it:
//! pending completion handles, per-phase timeout tasks, and — while
//! `Connected` — the data stream producer. [`PhaseStore`] is the single
//! source of truth for the live phase and enforces that leaving a phase
//! releases its resources exactly once.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::streaming::DataProducer;

/// A one-shot handle resumed exactly once when the operation it represents
/// completes or is cancelled.
pub type CompletionHandle = oneshot::Sender<Result<(), Error>>;

/// A peripheral handle abstracted over the concrete BLE backend, so the
/// phase machine and its tests do not depend on `btleplug` directly.
pub trait BlePeripheral: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// The platform-stable identifier of this peripheral.
    fn id(&self) -> blelink_types::PeripheralId;
}

/// The connection lifecycle's current position and the resources it owns.
///
/// See the phase-ownership table: each variant documents exactly the
/// resources it is responsible for releasing when left.
#[derive(Debug)]
pub enum Phase<P: BlePeripheral> {
    /// No connection attempt in progress. Owns nothing.
    Idle,
    /// Waiting for the radio to report poweredOn. Owns a pending
    /// completion handle.
    WaitingForRadio {
        /// Resumed once the radio is usable, permanently unusable, or the
        /// power-off grace window expires.
        completion: CompletionHandle,
    },
    /// Platform connect request outstanding. Owns the peripheral handle,
    /// the completion of `connect`, and the connect-timeout task.
    Connecting {
        peripheral: P,
        completion: CompletionHandle,
        timeout: CancellationToken,
    },
    /// GATT service discovery outstanding, filtered to the target service.
    /// The completion handle and timeout are carried forward from
    /// `Connecting`/`AutoReconnecting` — the service-discovery timeout
    /// spans this entire sub-chain.
    DiscoveringServices {
        peripheral: P,
        completion: CompletionHandle,
        timeout: CancellationToken,
    },
    /// Characteristic discovery outstanding for the TX/RX characteristics.
    DiscoveringCharacteristics {
        peripheral: P,
        completion: CompletionHandle,
        timeout: CancellationToken,
    },
    /// Notify-enable requested on the RX characteristic.
    SubscribingToNotifications {
        peripheral: P,
        completion: CompletionHandle,
        timeout: CancellationToken,
    },
    /// Discovery finished; no outstanding completion. The caller-visible
    /// `connect` has not yet created the data stream.
    DiscoveryComplete { peripheral: P },
    /// Fully connected and ready to send/receive. Owns the data stream
    /// producer and the RSSI keepalive task.
    Connected {
        peripheral: P,
        producer: DataProducer,
        keepalive: CancellationToken,
    },
    /// A transient disconnect with platform-driven reconnection in
    /// progress. Owns the peripheral handle and the auto-reconnect
    /// discovery timeout; TX/RX are not yet reconfirmed.
    AutoReconnecting {
        peripheral: P,
        timeout: CancellationToken,
    },
    /// OS state restoration delivered a peripheral from a previous process
    /// launch.
    RestoringState { peripheral: P },
    /// A disconnect request is outstanding; waiting briefly for the
    /// platform's acknowledgement.
    Disconnecting { peripheral: P },
}

impl<P: BlePeripheral> Phase<P> {
    /// A stable, lowercase-free name for logging and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::WaitingForRadio { .. } => "WaitingForRadio",
            Phase::Connecting { .. } => "Connecting",
            Phase::DiscoveringServices { .. } => "DiscoveringServices",
            Phase::DiscoveringCharacteristics { .. } => "DiscoveringCharacteristics",
            Phase::SubscribingToNotifications { .. } => "SubscribingToNotifications",
            Phase::DiscoveryComplete { .. } => "DiscoveryComplete",
            Phase::Connected { .. } => "Connected",
            Phase::AutoReconnecting { .. } => "AutoReconnecting",
            Phase::RestoringState { .. } => "RestoringState",
            Phase::Disconnecting { .. } => "Disconnecting",
        }
    }

    /// The peripheral this phase is operating on, if any.
    pub fn peripheral(&self) -> Option<&P> {
        match self {
            Phase::Idle | Phase::WaitingForRadio { .. } => None,
            Phase::Connecting { peripheral, .. }
            | Phase::DiscoveringServices { peripheral, .. }
            | Phase::DiscoveringCharacteristics { peripheral, .. }
            | Phase::SubscribingToNotifications { peripheral, .. }
            | Phase::DiscoveryComplete { peripheral }
            | Phase::Connected { peripheral, .. }
            | Phase::AutoReconnecting { peripheral, .. }
            | Phase::RestoringState { peripheral }
            | Phase::Disconnecting { peripheral } => Some(peripheral),
        }
    }

    /// Whether `send` may be attempted in this phase.
    pub fn is_connected(&self) -> bool {
        matches!(self, Phase::Connected { .. })
    }

    /// Release every resource this phase owns: cancel its timeout (if
    /// any), resume its pending completion with `error` (if any), and drop
    /// its data producer (if any), finalizing the stream for its
    /// consumer. Consumes the phase so it cannot be used again.
    ///
    /// Invariant: called at most once per phase instance — `PhaseStore`
    /// only ever calls this on a phase it just removed from `current`.
    pub fn release(self, error: Error) {
        match self {
            Phase::Idle | Phase::DiscoveryComplete { .. } | Phase::RestoringState { .. } => {}
            Phase::WaitingForRadio { completion } => {
                let _ = completion.send(Err(error));
            }
            Phase::Connecting {
                completion,
                timeout,
                ..
            }
            | Phase::DiscoveringServices {
                completion,
                timeout,
                ..
            }
            | Phase::DiscoveringCharacteristics {
                completion,
                timeout,
                ..
            }
            | Phase::SubscribingToNotifications {
                completion,
                timeout,
                ..
            } => {
                timeout.cancel();
                let _ = completion.send(Err(error));
            }
            Phase::Connected {
                producer,
                keepalive,
                ..
            } => {
                keepalive.cancel();
                drop(producer); // finalizes the stream for its consumer
            }
            Phase::AutoReconnecting { timeout, .. } => {
                timeout.cancel();
            }
            Phase::Disconnecting { .. } => {}
        }
    }
}

/// Single source of truth for the current [`Phase`].
///
/// Transitions are serialized by the state machine's single-threaded
/// cooperative context; `PhaseStore` itself holds no lock because its
/// methods are only ever called from that context.
#[derive(Debug)]
pub struct PhaseStore<P: BlePeripheral> {
    current: Phase<P>,
    phase_start: Instant,
}

impl<P: BlePeripheral> Default for PhaseStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: BlePeripheral> PhaseStore<P> {
    /// A store starting at `Idle`.
    pub fn new() -> Self {
        Self {
            current: Phase::Idle,
            phase_start: Instant::now(),
        }
    }

    /// The live phase.
    pub fn current(&self) -> &Phase<P> {
        &self.current
    }

    /// Time spent in the live phase so far.
    pub fn elapsed_in_phase(&self) -> Duration {
        self.phase_start.elapsed()
    }

    /// Replace the live phase with `new_phase`, logging (old, new, elapsed).
    ///
    /// This does **not** release the outgoing phase's resources — use it
    /// only for forward progress along the happy path, where completion
    /// handles and timeouts are deliberately carried forward into the new
    /// variant. To release resources on error or cancellation, use
    /// [`PhaseStore::cancel_current`].
    pub fn transition(&mut self, new_phase: Phase<P>) -> Phase<P> {
        let from = self.current.name();
        let to = new_phase.name();
        let elapsed = self.elapsed_in_phase();
        tracing::debug!(from, to, elapsed_ms = elapsed.as_millis() as u64, "phase transition");
        self.phase_start = Instant::now();
        std::mem::replace(&mut self.current, new_phase)
    }

    /// Resume the live phase's pending completion with `error` (if any),
    /// finalize its data producer (if any), cancel its timeout (if any),
    /// and transition to `Idle`.
    pub fn cancel_current(&mut self, error: Error) {
        let outgoing = self.transition(Phase::Idle);
        outgoing.release(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blelink_types::PeripheralId;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone)]
    struct TestPeripheral(PeripheralId);

    impl BlePeripheral for TestPeripheral {
        fn id(&self) -> PeripheralId {
            self.0.clone()
        }
    }

    fn peripheral(id: &str) -> TestPeripheral {
        TestPeripheral(PeripheralId::new(id))
    }

    #[test]
    fn test_new_store_starts_idle() {
        let store: PhaseStore<TestPeripheral> = PhaseStore::new();
        assert_eq!(store.current().name(), "Idle");
        assert!(store.current().peripheral().is_none());
    }

    #[test]
    fn test_transition_replaces_phase_and_returns_outgoing() {
        let mut store: PhaseStore<TestPeripheral> = PhaseStore::new();
        let (tx, _rx) = oneshot::channel();
        let outgoing = store.transition(Phase::Connecting {
            peripheral: peripheral("d1"),
            completion: tx,
            timeout: CancellationToken::new(),
        });
        assert_eq!(outgoing.name(), "Idle");
        assert_eq!(store.current().name(), "Connecting");
        assert_eq!(store.current().peripheral().unwrap().id().as_str(), "d1");
    }

    #[tokio::test]
    async fn test_cancel_current_resumes_completion_with_error() {
        let mut store: PhaseStore<TestPeripheral> = PhaseStore::new();
        let (tx, rx) = oneshot::channel();
        store.transition(Phase::Connecting {
            peripheral: peripheral("d1"),
            completion: tx,
            timeout: CancellationToken::new(),
        });

        store.cancel_current(Error::Cancelled);

        assert_eq!(store.current().name(), "Idle");
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancel_current_cancels_timeout_token() {
        let mut store: PhaseStore<TestPeripheral> = PhaseStore::new();
        let (tx, _rx) = oneshot::channel();
        let token = CancellationToken::new();
        store.transition(Phase::Connecting {
            peripheral: peripheral("d1"),
            completion: tx,
            timeout: token.clone(),
        });

        assert!(!token.is_cancelled());
        store.cancel_current(Error::Cancelled);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_leaving_connected_finalizes_producer_and_keepalive() {
        let mut store: PhaseStore<TestPeripheral> = PhaseStore::new();
        let (producer, mut consumer) = mpsc::channel(4);
        let keepalive = CancellationToken::new();
        store.transition(Phase::Connected {
            peripheral: peripheral("d1"),
            producer,
            keepalive: keepalive.clone(),
        });

        store.cancel_current(Error::NotConnected);

        assert!(keepalive.is_cancelled());
        // Producer was dropped, so the consumer observes channel closure.
        assert_eq!(consumer.recv().await, None);
    }

    #[test]
    fn test_is_connected_only_true_for_connected_phase() {
        let idle: Phase<TestPeripheral> = Phase::Idle;
        assert!(!idle.is_connected());

        let (producer, _consumer) = mpsc::channel(4);
        let connected = Phase::Connected {
            peripheral: peripheral("d1"),
            producer,
            keepalive: CancellationToken::new(),
        };
        assert!(connected.is_connected());
    }

    #[test]
    fn test_service_discovery_timeout_carried_across_discovery_chain() {
        let mut store: PhaseStore<TestPeripheral> = PhaseStore::new();
        let (tx, _rx) = oneshot::channel();
        let token = CancellationToken::new();
        store.transition(Phase::DiscoveringServices {
            peripheral: peripheral("d1"),
            completion: tx,
            timeout: token.clone(),
        });

        // Advancing within the discovery chain carries the same token
        // forward rather than creating a new one.
        let (tx2, _rx2) = oneshot::channel();
        let outgoing = store.transition(Phase::DiscoveringCharacteristics {
            peripheral: peripheral("d1"),
            completion: tx2,
            timeout: token.clone(),
        });
        // The outgoing DiscoveringServices phase must NOT be released here
        // (that would cancel the shared timeout); it is simply discarded
        // without calling `.release()`.
        drop(outgoing);
        assert!(!token.is_cancelled());
    }
}
