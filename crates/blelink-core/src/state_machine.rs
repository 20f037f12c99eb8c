//! The state machine core: orchestrates the phase store, generation
//! fence, write pipeline, keepalive scheduler, scan state, and delegate
//! bridge into the connection lifecycle described by the connection
//! setup and auto-reconnect protocols.
//!
//! Every public entrypoint here is reachable either directly (tests,
//! diagnostics, the operations §6.2 lists as "below the facade") or via
//! [`crate::facade::Transport`]. Methods that must survive a concurrent
//! `shutdown` or timeout take `self: &Arc<Self>` so they can spawn the
//! timeout tasks whose callbacks need to call back in.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use blelink_types::{GattProfile, PeripheralId, PowerState};

use crate::bridge::{self, ProducerSlot};
use crate::config::Config;
use crate::diagnostics::DiagnosticsCollector;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, DisconnectReason, EventDispatcher, EventReceiver};
use crate::generation::GenerationFence;
use crate::keepalive::{self, KeepaliveFailureCounter};
use crate::metrics::ConnectionMetrics;
use crate::phase::{BlePeripheral, CompletionHandle, Phase, PhaseStore};
use crate::radio::{RadioAdapter, UnsolicitedEvent};
use crate::scan::{DiscoveryCallback, ScanState};
use crate::streaming::DataStream;
use crate::util::short_id;
use crate::write_pipeline::WritePipeline;

/// Invoked once per disconnection, successful or not, with the device id
/// and the error that caused it (`None` for a caller-requested
/// disconnect/shutdown).
pub type DisconnectionHandler = Box<dyn Fn(PeripheralId, Option<Error>) + Send + Sync>;

/// Invoked when auto-reconnect or OS state restoration produces a fresh
/// `Connected` phase. The new data stream must be captured before the
/// handler returns, since it is not delivered any other way.
pub type ReconnectionHandler = Box<dyn Fn(PeripheralId, DataStream) + Send + Sync>;

/// Race `fut` against the oneshot `rx` carried by the phase currently
/// being driven forward. If `rx` resolves first, the current step was
/// cancelled out from under this caller (by `shutdown`, a timeout, or a
/// stale-callback fence elsewhere) — propagate whatever error it carries
/// or `Error::Cancelled` if the sender was dropped without sending.
async fn race<T>(
    rx: &mut oneshot::Receiver<std::result::Result<(), Error>>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::pin!(fut);
    tokio::select! {
        biased;
        resumed = &mut *rx => Err(resumed.unwrap_or(Err(Error::Cancelled)).err().unwrap_or(Error::Cancelled)),
        result = &mut fut => result,
    }
}

/// Owns the connection lifecycle for a single peripheral. See the module
/// docs for the `Arc<Self>` receiver convention.
pub struct StateMachine<R: RadioAdapter> {
    radio: Arc<R>,
    profile: GattProfile,
    config: Config,
    phase: AsyncMutex<PhaseStore<R::Peripheral>>,
    generation: GenerationFence,
    write_pipeline: Arc<WritePipeline>,
    scan: ScanState,
    producer: ProducerSlot,
    /// The stream for the phase most recently entered via `Connected`;
    /// taken by whichever of `connect()`'s return value or
    /// `received_data()` observes it first.
    pending_stream: StdMutex<Option<DataStream>>,
    device_id: StdMutex<Option<PeripheralId>>,
    power_state: StdMutex<PowerState>,
    foreground: AtomicBool,
    disconnection_handler: StdMutex<Option<DisconnectionHandler>>,
    reconnection_handler: StdMutex<Option<ReconnectionHandler>>,
    events: EventDispatcher,
    keepalive_failures: Arc<KeepaliveFailureCounter>,
    diagnostics: Arc<DiagnosticsCollector>,
    metrics: Arc<ConnectionMetrics>,
    activated: AtomicBool,
}

impl<R: RadioAdapter + 'static> StateMachine<R> {
    /// Construct a state machine. Call [`Self::activate`] before driving
    /// it; the facade does this automatically.
    pub fn new(radio: Arc<R>, profile: GattProfile, config: Config) -> Arc<Self> {
        Arc::new(Self {
            radio,
            profile,
            write_pipeline: Arc::new(WritePipeline::new(config.write_timeout, config.write_pacing_delay)),
            phase: AsyncMutex::new(PhaseStore::new()),
            generation: GenerationFence::new(config.disconnect_timestamp_tolerance),
            scan: ScanState::new(),
            producer: Arc::new(StdMutex::new(None)),
            pending_stream: StdMutex::new(None),
            device_id: StdMutex::new(None),
            power_state: StdMutex::new(PowerState::Unknown),
            foreground: AtomicBool::new(true),
            disconnection_handler: StdMutex::new(None),
            reconnection_handler: StdMutex::new(None),
            events: EventDispatcher::default(),
            keepalive_failures: Arc::new(KeepaliveFailureCounter::new()),
            diagnostics: Arc::new(DiagnosticsCollector::new()),
            metrics: Arc::new(ConnectionMetrics::new()),
            activated: AtomicBool::new(false),
            config,
        })
    }

    /// Lazily wire up the radio adapter's event pump. Idempotent.
    pub async fn activate(self: &Arc<Self>) -> Result<()> {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(state) = self.radio.power_state().await {
            *self.power_state.lock().unwrap() = state;
        }
        bridge::spawn(Arc::clone(&self.radio), Arc::clone(&self.producer), Arc::clone(self));
        Ok(())
    }

    // ---- configuration / registration -----------------------------------

    pub fn set_device_id(&self, id: PeripheralId) {
        *self.device_id.lock().unwrap() = Some(id);
    }

    pub fn set_disconnection_handler(&self, handler: DisconnectionHandler) {
        *self.disconnection_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_reconnection_handler(&self, handler: ReconnectionHandler) {
        *self.reconnection_handler.lock().unwrap() = Some(handler);
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    // ---- observational ----------------------------------------------------

    pub async fn current_phase_name(&self) -> &'static str {
        self.phase.lock().await.current().name()
    }

    pub fn bluetooth_state_name(&self) -> String {
        self.power_state.lock().unwrap().to_string()
    }

    pub fn is_connected(&self) -> bool {
        self.pending_stream_is_live() || self.producer.lock().unwrap().is_some()
    }

    fn pending_stream_is_live(&self) -> bool {
        // A pending stream that hasn't been taken yet still counts as
        // "connected" for observational purposes.
        self.pending_stream.lock().unwrap().is_some()
    }

    pub fn connected_device_id(&self) -> Option<PeripheralId> {
        self.device_id.lock().unwrap().clone().filter(|_| self.is_connected())
    }

    pub async fn current_peripheral_state(&self) -> Option<bool> {
        let phase = self.phase.lock().await;
        let peripheral = phase.current().peripheral()?.clone();
        drop(phase);
        self.radio.is_connected(&peripheral).await.ok()
    }

    pub async fn is_device_connected_to_system(&self) -> Result<bool> {
        let Some(id) = self.device_id.lock().unwrap().clone() else {
            return Ok(false);
        };
        let peers = self.radio.connected_peripherals().await?;
        Ok(peers.iter().any(|p| p.id() == id))
    }

    /// Take the consumer end of the most recently created data stream, if
    /// it has not already been claimed. Returns an already-closed stream
    /// otherwise, per the facade contract ("empty stream if not
    /// connected").
    pub fn received_data(&self) -> DataStream {
        self.pending_stream
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| {
                let (_producer, stream) = DataStream::channel(1);
                stream
            })
    }

    // ---- radio power ------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn wait_for_powered_on(self: &Arc<Self>) -> Result<()> {
        let state = *self.power_state.lock().unwrap();
        if state.is_usable() {
            return Ok(());
        }
        if state.is_permanent_failure() {
            return Err(if state == PowerState::Unsupported {
                Error::RadioUnavailable
            } else {
                Error::RadioUnauthorized
            });
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut phase = self.phase.lock().await;
            phase.transition(Phase::WaitingForRadio { completion: tx });
        }
        if state == PowerState::PoweredOff {
            self.arm_power_off_grace();
        }
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    fn arm_power_off_grace(self: &Arc<Self>) {
        let sm = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(sm.config.power_off_grace).await;
            let mut phase = sm.phase.lock().await;
            if let Phase::WaitingForRadio { .. } = phase.current() {
                let state = *sm.power_state.lock().unwrap();
                if state.is_usable() {
                    return; // resolved by the state-change handler already
                }
                phase.cancel_current(Error::RadioPoweredOff);
            }
        });
    }

    // ---- connection setup protocol (§4.5) ---------------------------------

    #[instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) -> Result<DataStream> {
        self.activate().await?;

        let device_id = self
            .device_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::DeviceNotFound(PeripheralId::new("")))?;

        {
            let phase = self.phase.lock().await;
            match phase.current() {
                Phase::Idle => {}
                Phase::Connected { peripheral, .. } if peripheral.id() == device_id => {
                    drop(phase);
                    return Ok(self.received_data());
                }
                other => {
                    warn!(
                        phase = other.name(),
                        device = %device_id,
                        "connect rejected: already in operation"
                    );
                    return Err(Error::AlreadyInOperation);
                }
            }
        }

        self.wait_for_powered_on().await?;

        let peripheral = self
            .radio
            .peripheral(&device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device_id.clone()))?;

        let generation = self.generation.advance();
        self.events.send(ConnectionEvent::ConnectionStarted { device: device_id.clone() });
        self.diagnostics.record_connection_attempt();
        let started = Instant::now();

        let (tx, rx) = oneshot::channel();
        let timeout_token = CancellationToken::new();
        {
            let mut phase = self.phase.lock().await;
            phase.transition(Phase::Connecting {
                peripheral: peripheral.clone(),
                completion: tx,
                timeout: timeout_token.clone(),
            });
        }
        self.diagnostics.record_transition("Idle", "Connecting").await;
        self.arm_connect_timeout(generation, peripheral.clone(), timeout_token);

        let mut rx = rx;
        let setup = self
            .run_discovery_chain(&mut rx, generation, peripheral.clone(), self.config.service_discovery_timeout, false)
            .await;
        match setup {
            Ok(()) => {
                let stream = self.enter_connected(peripheral.clone()).await;
                self.events.send(ConnectionEvent::Connected { device: device_id.clone() });
                self.diagnostics.record_connection_success();
                self.metrics.connect.record_success(started.elapsed());
                info!(device = %device_id, "connected");
                Ok(stream)
            }
            Err(err) => {
                let mut phase = self.phase.lock().await;
                phase.cancel_current(Error::Cancelled);
                self.diagnostics.record_connection_failure();
                self.diagnostics.record_error(&err, Some(device_id.to_string())).await;
                self.metrics.connect.record_failure(started.elapsed());
                Err(err)
            }
        }
    }

    fn arm_connect_timeout(self: &Arc<Self>, generation: u64, peripheral: R::Peripheral, token: CancellationToken) {
        let sm = Arc::clone(self);
        keepalive::spawn_phase_timeout(self.config.connect_timeout, token, generation, move |gen| {
            tokio::spawn(async move {
                sm.on_connect_timeout(gen, peripheral).await;
            });
        });
    }

    async fn on_connect_timeout(self: Arc<Self>, generation: u64, peripheral: R::Peripheral) {
        if !self.generation.validate_generation_tag(generation) {
            return;
        }
        let mut phase = self.phase.lock().await;
        if !matches!(phase.current(), Phase::Connecting { .. }) {
            return;
        }
        let _ = self.radio.cancel_connect(&peripheral).await;
        phase.cancel_current(Error::ConnectionTimeout(self.config.connect_timeout));
    }

    /// Runs steps 6–9 of §4.5 / the reconnect rediscovery subchain: connect,
    /// discover services, discover characteristics, subscribe. On success
    /// the phase is left at `DiscoveryComplete`.
    async fn run_discovery_chain(
        self: &Arc<Self>,
        rx: &mut oneshot::Receiver<std::result::Result<(), Error>>,
        generation: u64,
        peripheral: R::Peripheral,
        discovery_timeout: Duration,
        foreground_gated: bool,
    ) -> Result<()> {
        race(rx, self.radio.connect(&peripheral)).await?;

        let timeout = CancellationToken::new();
        self.carry_completion_forward(|completion| Phase::DiscoveringServices {
            peripheral: peripheral.clone(),
            completion,
            timeout: timeout.clone(),
        })
        .await;
        self.arm_discovery_timeout(generation, timeout.clone(), discovery_timeout, foreground_gated);

        race(rx, self.radio.discover_services(&peripheral, &self.profile)).await?;

        self.carry_completion_forward(|completion| Phase::DiscoveringCharacteristics {
            peripheral: peripheral.clone(),
            completion,
            timeout: timeout.clone(),
        })
        .await;

        race(rx, self.radio.discover_characteristics(&peripheral, &self.profile)).await?;

        self.carry_completion_forward(|completion| Phase::SubscribingToNotifications {
            peripheral: peripheral.clone(),
            completion,
            timeout: timeout.clone(),
        })
        .await;

        race(rx, self.radio.subscribe(&peripheral, &self.profile)).await?;

        timeout.cancel();
        {
            let mut phase = self.phase.lock().await;
            // Discard the completion: it is resumed only on failure along
            // this chain, or carried into `Connected` where `disconnect`
            // and unsolicited-disconnect handling take over error
            // reporting via the disconnection handler instead.
            let _ = phase.transition(Phase::Idle);
            phase.transition(Phase::DiscoveryComplete { peripheral });
        }
        Ok(())
    }

    /// Extract the completion handle from whichever discovery-chain phase
    /// is currently live and rebuild it as `build`'s phase, preserving the
    /// handle rather than dropping it — `PhaseStore::transition` does not
    /// release the outgoing phase, but it does drop it, which would
    /// silently close the completion channel if we didn't pull the handle
    /// out first.
    async fn carry_completion_forward(
        self: &Arc<Self>,
        build: impl FnOnce(CompletionHandle) -> Phase<R::Peripheral>,
    ) {
        let mut phase = self.phase.lock().await;
        let outgoing = phase.transition(Phase::Idle);
        let completion = match outgoing {
            Phase::Connecting { completion, .. }
            | Phase::DiscoveringServices { completion, .. }
            | Phase::DiscoveringCharacteristics { completion, .. }
            | Phase::SubscribingToNotifications { completion, .. } => completion,
            _ => return,
        };
        phase.transition(build(completion));
    }

    /// Arms the timeout spanning the services → characteristics →
    /// subscribe subchain, shared by both the fresh-connect path
    /// (`service_discovery_timeout`, never foreground-gated) and the
    /// reconnect-rediscovery path (`auto_reconnect_discovery_timeout`,
    /// suppressed while backgrounded).
    fn arm_discovery_timeout(self: &Arc<Self>, generation: u64, token: CancellationToken, duration: Duration, foreground_gated: bool) {
        let sm = Arc::clone(self);
        keepalive::spawn_phase_timeout(duration, token, generation, move |gen| {
            tokio::spawn(async move {
                sm.on_discovery_timeout(gen, duration, foreground_gated).await;
            });
        });
    }

    async fn on_discovery_timeout(self: Arc<Self>, generation: u64, duration: Duration, foreground_gated: bool) {
        if foreground_gated && !self.foreground.load(Ordering::SeqCst) {
            return; // suppressed while backgrounded
        }
        if !self.generation.validate_generation_tag(generation) {
            return;
        }
        let mut phase = self.phase.lock().await;
        if matches!(
            phase.current(),
            Phase::DiscoveringServices { .. }
                | Phase::DiscoveringCharacteristics { .. }
                | Phase::SubscribingToNotifications { .. }
        ) {
            phase.cancel_current(Error::ConnectionTimeout(duration));
        }
    }

    /// Creates the data stream, publishes the producer to the bridge,
    /// and transitions `DiscoveryComplete` → `Connected`, starting the
    /// RSSI keepalive.
    async fn enter_connected(self: &Arc<Self>, peripheral: R::Peripheral) -> DataStream {
        let (producer, stream) = DataStream::channel(self.config.data_stream_buffer);
        *self.producer.lock().unwrap() = Some(producer.clone());

        let keepalive_token = CancellationToken::new();
        {
            let mut phase = self.phase.lock().await;
            phase.transition(Phase::Connected {
                peripheral: peripheral.clone(),
                producer,
                keepalive: keepalive_token.clone(),
            });
        }
        self.spawn_keepalive(peripheral, keepalive_token);
        self.metrics.mark_connected();
        self.diagnostics.record_transition("DiscoveryComplete", "Connected").await;
        *self.pending_stream.lock().unwrap() = Some(stream);
        self.received_data()
    }

    fn spawn_keepalive(self: &Arc<Self>, peripheral: R::Peripheral, token: CancellationToken) {
        let radio = Arc::clone(&self.radio);
        let failures = Arc::clone(&self.keepalive_failures);
        let diagnostics = Arc::clone(&self.diagnostics);
        let metrics = Arc::clone(&self.metrics);
        let period = self.config.rssi_keepalive_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let started = Instant::now();
                        match radio.read_rssi(&peripheral).await {
                            Ok(_) => {
                                failures.record_success();
                                diagnostics.record_keepalive_recovered();
                                metrics.reads.record_success(started.elapsed());
                            }
                            Err(_) => {
                                let consecutive = failures.record_failure();
                                diagnostics.record_keepalive_failure(consecutive);
                                metrics.reads.record_failure(started.elapsed());
                            }
                        }
                    }
                }
            }
        });
    }

    // ---- send / write pipeline (§4.3) -------------------------------------

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn send(self: &Arc<Self>, bytes: Bytes) -> Result<()> {
        let len = bytes.len() as u64;
        let pipeline = Arc::clone(&self.write_pipeline);
        let radio = Arc::clone(&self.radio);
        let profile = self.profile;
        let peripheral = {
            let phase = self.phase.lock().await;
            match phase.current() {
                Phase::Connected { peripheral, .. } => peripheral.clone(),
                _ => return Err(Error::NotConnected),
            }
        };
        let sm = Arc::clone(self);
        let peripheral_for_check = peripheral.clone();
        let pipeline_for_issue = Arc::clone(&pipeline);
        self.diagnostics.record_write_issued();
        let started = Instant::now();
        let result = pipeline
            .send(
                bytes,
                move || sm.is_connected(),
                move |sequence, bytes| {
                    let radio = Arc::clone(&radio);
                    let peripheral = peripheral_for_check.clone();
                    let pipeline = Arc::clone(&pipeline_for_issue);
                    async move {
                        // `radio.write` already resolves only once the
                        // platform has acknowledged the write-with-response,
                        // so completion is known here rather than via a
                        // separate delegate callback; report it immediately.
                        match radio.write(&peripheral, &profile, sequence, bytes).await {
                            Ok(()) => {
                                pipeline.complete(sequence, Ok(()));
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    }
                },
            )
            .await;
        match &result {
            Ok(()) => {
                self.diagnostics.record_write_succeeded();
                self.metrics.writes.record_success(started.elapsed());
                self.metrics.record_bytes_written(len);
            }
            Err(Error::OperationTimeout(_)) => {
                self.diagnostics.record_write_timed_out();
                self.metrics.writes.record_failure(started.elapsed());
            }
            Err(_) => {
                self.diagnostics.record_write_rejected();
                self.metrics.writes.record_failure(started.elapsed());
            }
        }
        result
    }

    // ---- disconnect / shutdown ---------------------------------------------

    #[instrument(skip(self))]
    pub async fn disconnect(self: &Arc<Self>) {
        let device_id = self.device_id.lock().unwrap().clone();
        self.write_pipeline.fail_all(|| Error::NotConnected);
        *self.producer.lock().unwrap() = None;

        let peripheral = {
            let phase = self.phase.lock().await;
            phase.current().peripheral().cloned()
        };
        if let Some(peripheral) = peripheral {
            let _ = self.radio.cancel_connect(&peripheral).await;
            tokio::time::sleep(self.config.disconnect_ack_wait).await;
        }
        let from = {
            let mut phase = self.phase.lock().await;
            let from = phase.current().name();
            phase.cancel_current(Error::Cancelled);
            from
        };
        self.diagnostics.record_transition(from, "Idle").await;
        self.metrics.mark_disconnected();
        if let Some(id) = device_id {
            self.events.send(ConnectionEvent::Disconnected {
                device: id.clone(),
                reason: DisconnectReason::Requested,
            });
            self.diagnostics.record_disconnection(&DisconnectReason::Requested).await;
            if let Some(handler) = self.disconnection_handler.lock().unwrap().as_ref() {
                handler(id, None);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn switch_device(self: &Arc<Self>, new_id: PeripheralId) -> Result<DataStream> {
        self.disconnect().await;
        self.set_device_id(new_id);
        self.connect().await
    }

    /// Idempotent teardown. Safe to call more than once.
    pub async fn shutdown(self: &Arc<Self>) {
        self.scan.stop();
        let _ = self.radio.stop_scan().await;
        self.write_pipeline.fail_all(|| Error::Cancelled);

        let device_id = self.device_id.lock().unwrap().clone();
        *self.producer.lock().unwrap() = None;
        {
            let mut phase = self.phase.lock().await;
            phase.cancel_current(Error::Cancelled);
        }
        if let Some(id) = device_id {
            if let Some(handler) = self.disconnection_handler.lock().unwrap().as_ref() {
                handler(id, None);
            }
        }
    }

    // ---- scanning (§4.7) ----------------------------------------------------

    pub async fn start_scanning(self: &Arc<Self>, callback: DiscoveryCallback) -> Result<()> {
        self.activate().await?;
        self.scan.set_discovery_callback(callback);
        let power = *self.power_state.lock().unwrap();
        if self.scan.try_start(power) {
            self.radio.start_scan(&self.profile).await?;
        }
        Ok(())
    }

    pub async fn stop_scanning(&self) {
        self.scan.stop();
        let _ = self.radio.stop_scan().await;
    }

    // ---- foreground / background (§4.4) -------------------------------------

    pub fn app_did_enter_background(&self) {
        self.foreground.store(false, Ordering::SeqCst);
        debug!("entered background");
    }

    pub async fn app_did_become_active(self: &Arc<Self>) {
        self.foreground.store(true, Ordering::SeqCst);
        let mut phase = self.phase.lock().await;
        let peripheral = match phase.current() {
            Phase::AutoReconnecting { peripheral, timeout } => {
                timeout.cancel();
                Some(peripheral.clone())
            }
            _ => None,
        };
        let Some(peripheral) = peripheral else { return };

        let generation = self.generation.advance();
        let new_token = CancellationToken::new();
        phase.transition(Phase::AutoReconnecting {
            peripheral,
            timeout: new_token.clone(),
        });
        drop(phase);
        self.arm_auto_reconnect_timeout(generation, new_token);
    }

    fn arm_auto_reconnect_timeout(self: &Arc<Self>, generation: u64, token: CancellationToken) {
        let sm = Arc::clone(self);
        keepalive::spawn_phase_timeout(self.config.auto_reconnect_discovery_timeout, token, generation, move |gen| {
            tokio::spawn(async move {
                sm.on_auto_reconnect_timeout(gen).await;
            });
        });
    }

    async fn on_auto_reconnect_timeout(self: Arc<Self>, generation: u64) {
        if !self.foreground.load(Ordering::SeqCst) {
            return; // suppressed while backgrounded
        }
        if !self.generation.validate_generation_tag(generation) {
            return;
        }
        let mut phase = self.phase.lock().await;
        if let Phase::AutoReconnecting { peripheral, .. } = phase.current() {
            let peripheral = peripheral.clone();
            let _ = self.radio.cancel_connect(&peripheral).await;
            phase.cancel_current(Error::ConnectionTimeout(self.config.auto_reconnect_discovery_timeout));
        }
    }

    // ---- unsolicited event handling (§4.6, §4.2) ----------------------------

    pub(crate) async fn handle_unsolicited(self: &Arc<Self>, event: UnsolicitedEvent<R::Peripheral>) {
        match event {
            UnsolicitedEvent::Notification { .. } => unreachable!("routed directly by the bridge"),
            UnsolicitedEvent::PowerStateChanged(state) => self.handle_power_state_changed(state).await,
            UnsolicitedEvent::Disconnected {
                peripheral,
                is_reconnecting,
                event_timestamp,
            } => {
                self.handle_disconnect(peripheral, is_reconnecting, event_timestamp).await;
            }
            UnsolicitedEvent::WillRestoreState { peripheral } => {
                self.handle_restore_state(peripheral).await;
            }
            UnsolicitedEvent::Discovered { id, rssi } => {
                self.scan.report_discovery(id.clone(), rssi);
                self.events.send(ConnectionEvent::Discovered { device: id, rssi });
            }
        }
    }

    async fn handle_power_state_changed(self: &Arc<Self>, state: PowerState) {
        *self.power_state.lock().unwrap() = state;
        // Resolve a caller parked in `wait_for_powered_on` by consuming its
        // completion handle with the correctly-categorized result.
        if state.is_usable() || state.is_permanent_failure() {
            let mut phase = self.phase.lock().await;
            if let Phase::WaitingForRadio { .. } = phase.current() {
                let outgoing = phase.transition(Phase::Idle);
                if let Phase::WaitingForRadio { completion } = outgoing {
                    let result = if state.is_usable() {
                        Ok(())
                    } else if state == PowerState::Unsupported {
                        Err(Error::RadioUnavailable)
                    } else {
                        Err(Error::RadioUnauthorized)
                    };
                    let _ = completion.send(result);
                }
            }
        }
        if state.is_usable() && self.scan.take_pending_on_power_on() {
            let _ = self.radio.start_scan(&self.profile).await;
        }
    }

    async fn handle_disconnect(self: &Arc<Self>, peripheral: R::Peripheral, is_reconnecting: bool, event_timestamp: Instant) {
        let mut phase = self.phase.lock().await;
        let Some(current_peripheral) = phase.current().peripheral() else {
            return; // Idle; nothing to disconnect
        };
        if !self.generation.validate_peripheral(&peripheral.id(), &current_peripheral.id()) {
            debug!(id = %short_id(&peripheral.id()), "dropped disconnect: peripheral mismatch");
            return;
        }
        if !self.generation.validate_event_timestamp(event_timestamp) {
            warn!(id = %short_id(&peripheral.id()), "dropped stale disconnect callback");
            return;
        }

        let was_live = matches!(
            phase.current(),
            Phase::DiscoveryComplete { .. } | Phase::Connected { .. } | Phase::AutoReconnecting { .. }
        );

        if is_reconnecting && was_live {
            self.write_pipeline.fail_all(|| Error::NotConnected);
            *self.producer.lock().unwrap() = None;
            let generation = self.generation.advance();
            let token = CancellationToken::new();
            phase.transition(Phase::AutoReconnecting {
                peripheral: peripheral.clone(),
                timeout: token.clone(),
            });
            drop(phase);
            self.arm_auto_reconnect_timeout(generation, token);
            self.metrics.mark_disconnected();
            self.diagnostics.record_reconnect_attempt();
            let id = peripheral.id();
            self.events.send(ConnectionEvent::ReconnectStarted { device: id.clone() });
            if let Some(handler) = self.disconnection_handler.lock().unwrap().as_ref() {
                handler(id, Some(Error::NotConnected));
            }
            self.spawn_reconnect_discovery(generation, peripheral);
        } else {
            self.write_pipeline.fail_all(|| Error::NotConnected);
            *self.producer.lock().unwrap() = None;
            phase.cancel_current(Error::NotConnected);
            drop(phase);
            self.metrics.mark_disconnected();
            self.diagnostics.record_disconnection(&DisconnectReason::PlatformDisconnect).await;
            let id = peripheral.id();
            self.events.send(ConnectionEvent::Disconnected {
                device: id.clone(),
                reason: DisconnectReason::PlatformDisconnect,
            });
            if let Some(handler) = self.disconnection_handler.lock().unwrap().as_ref() {
                handler(id, Some(Error::NotConnected));
            }
        }
    }

    /// Repeats the rediscovery subchain (steps 6–9 of §4.5) after an
    /// auto-reconnect `didConnect`. Spawned detached: its own generation
    /// tag guards it against a subsequent disconnect/reconnect cycle.
    ///
    /// Hands the phase off to `Connecting` with a freshly-minted
    /// completion before entering the shared chain — `AutoReconnecting`
    /// and `RestoringState` carry no completion of their own, and
    /// `carry_completion_forward` only knows how to extract one from the
    /// chain phases themselves.
    fn spawn_reconnect_discovery(self: &Arc<Self>, generation: u64, peripheral: R::Peripheral) {
        let sm = Arc::clone(self);
        tokio::spawn(async move {
            if !sm.generation.validate_generation_tag(generation) {
                return;
            }
            let (tx, mut rx) = oneshot::channel::<std::result::Result<(), Error>>();
            {
                let mut phase = sm.phase.lock().await;
                if !matches!(phase.current(), Phase::AutoReconnecting { .. } | Phase::RestoringState { .. }) {
                    return;
                }
                phase.transition(Phase::Connecting {
                    peripheral: peripheral.clone(),
                    completion: tx,
                    timeout: CancellationToken::new(),
                });
            }
            let started = Instant::now();
            let setup = sm
                .run_discovery_chain(&mut rx, generation, peripheral.clone(), sm.config.auto_reconnect_discovery_timeout, true)
                .await;
            match setup {
                Ok(()) => {
                    if !sm.generation.validate_generation_tag(generation) {
                        return;
                    }
                    let stream = sm.enter_connected(peripheral.clone()).await;
                    sm.diagnostics.record_reconnect_success();
                    sm.metrics.reconnects.record_success(started.elapsed());
                    let id = peripheral.id();
                    sm.events.send(ConnectionEvent::ReconnectSucceeded { device: id.clone() });
                    if let Some(handler) = sm.reconnection_handler.lock().unwrap().take() {
                        handler(id, stream);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "auto-reconnect rediscovery failed");
                    sm.metrics.reconnects.record_failure(started.elapsed());
                    sm.diagnostics.record_error(&err, Some(peripheral.id().to_string())).await;
                    let mut phase = sm.phase.lock().await;
                    phase.cancel_current(err);
                }
            }
        });
    }

    /// OS state-restoration path (§4.6): jumps straight into rediscovery if
    /// the peripheral is already connected at the platform layer, waits
    /// for `didConnect` if mid-connect, otherwise issues a fresh connect.
    async fn handle_restore_state(self: &Arc<Self>, peripheral: R::Peripheral) {
        {
            let phase = self.phase.lock().await;
            if !matches!(phase.current(), Phase::Idle) {
                return;
            }
        }
        self.set_device_id(peripheral.id());
        let generation = self.generation.advance();
        {
            let mut phase = self.phase.lock().await;
            phase.transition(Phase::RestoringState { peripheral: peripheral.clone() });
        }
        let already_connected = self.radio.is_connected(&peripheral).await.unwrap_or(false);
        if already_connected {
            self.spawn_reconnect_discovery(generation, peripheral);
        } else if self.radio.connect(&peripheral).await.is_ok() {
            self.spawn_reconnect_discovery(generation, peripheral);
        } else {
            let mut phase = self.phase.lock().await;
            phase.cancel_current(Error::ConnectionFailed("state restoration failed to reconnect".into()));
        }
    }

    pub fn keepalive_failure_count(&self) -> u32 {
        self.keepalive_failures.current()
    }

    /// Record bytes delivered via an inbound notification. Called directly
    /// from the bridge's notification branch (a plain atomic add, never an
    /// awaitable operation) so the byte-counter metric stays in step with
    /// data the bridge yields straight to the producer, without routing
    /// the payload itself back through the state machine's command path.
    pub(crate) fn record_bytes_read(&self, len: u64) {
        self.metrics.record_bytes_read(len);
    }

    pub fn write_queue_depth(&self) -> usize {
        self.write_pipeline.queue_depth()
    }

    /// Read-only diagnostics snapshot, for a host application's diagnostics
    /// screen. See [`crate::diagnostics`].
    pub fn diagnostics(&self) -> Arc<DiagnosticsCollector> {
        Arc::clone(&self.diagnostics)
    }
}

impl<R: RadioAdapter> std::fmt::Debug for StateMachine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("device_id", &self.device_id.lock().unwrap())
            .field("activated", &self.activated.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
