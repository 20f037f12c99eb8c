//! The delegate bridge: pumps [`UnsolicitedEvent`]s from a [`RadioAdapter`]
//! into the state machine's serialized context, with one exception.
//!
//! Inbound notification payloads are the one event this bridge does not
//! forward into the state machine's command queue. They are written
//! directly into the live [`DataProducer`], under a short, non-awaiting
//! lock, so that a slow or busy state machine can never reorder or stall
//! delivery of bytes already in arrival order on the BLE side. Everything
//! else — unsolicited disconnects, power-state changes, OS state
//! restoration — is control flow, and is forwarded to
//! [`crate::state_machine::StateMachine::handle_unsolicited`].

use std::sync::{Arc, Mutex as StdMutex};

use tracing::trace;

use crate::radio::{RadioAdapter, UnsolicitedEvent};
use crate::state_machine::StateMachine;
use crate::streaming::{self, DataProducer};

/// Shared, lock-guarded reference to the data producer for the live
/// `Connected` phase.
///
/// Dual-homed per the design: the state machine core sets it when
/// `Connected` is entered and clears it (before finalizing the producer)
/// when `Connected` is left; the bridge only ever reads it to publish
/// inbound bytes. The critical section never holds an awaitable
/// operation.
pub type ProducerSlot = Arc<StdMutex<Option<DataProducer>>>;

/// Spawn the event pump for `radio`, forwarding unsolicited events to `sm`
/// and publishing notifications directly to `producer`.
///
/// Runs until the radio's event channel closes (the adapter was dropped).
/// Called once, from `StateMachine::activate`.
pub fn spawn<R: RadioAdapter + 'static>(
    radio: Arc<R>,
    producer: ProducerSlot,
    sm: Arc<StateMachine<R>>,
) -> tokio::task::JoinHandle<()> {
    let mut events = radio.take_events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UnsolicitedEvent::Notification { bytes, .. } => {
                    sm.record_bytes_read(bytes.len() as u64);
                    let guard = producer.lock().unwrap();
                    if let Some(p) = guard.as_ref() {
                        streaming::publish(p, bytes);
                    } else {
                        trace!("dropped notification: no live data stream");
                    }
                }
                other => {
                    sm.handle_unsolicited(other).await;
                }
            }
        }
    })
}
