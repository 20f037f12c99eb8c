//! Peripheral scanning, independent of the connection [`Phase`](crate::phase::Phase).
//!
//! Scanning is orthogonal to the connection lifecycle and may be active
//! while `Connected`. `start_scanning` checks the radio's power state
//! before starting: if not yet `poweredOn`, the request is buffered and
//! replayed automatically once the radio reports `poweredOn`.

use std::sync::{Arc, Mutex};

use blelink_types::{PeripheralId, PowerState};
use tracing::{debug, info};

/// `(peripheral_id, rssi)` delivered for each discovery during an active
/// scan.
pub type DiscoveryCallback = Box<dyn Fn(PeripheralId, i16) + Send + Sync>;

/// Scan state, held independently of the connection phase.
pub struct ScanState {
    inner: Mutex<Inner>,
}

struct Inner {
    scanning: bool,
    pending_scan_request: bool,
    callback: Option<Arc<DiscoveryCallback>>,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanState {
    /// A state with no scan active and no pending request.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                scanning: false,
                pending_scan_request: false,
                callback: None,
            }),
        }
    }

    /// Whether a scan is currently active.
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().unwrap().scanning
    }

    /// Whether `start_scanning` is buffered awaiting `poweredOn`.
    pub fn has_pending_request(&self) -> bool {
        self.inner.lock().unwrap().pending_scan_request
    }

    /// Register the discovery callback, replacing any previous one.
    pub fn set_discovery_callback(&self, callback: DiscoveryCallback) {
        self.inner.lock().unwrap().callback = Some(Arc::new(callback));
    }

    /// Record a discovery and invoke the registered callback, if any.
    pub fn report_discovery(&self, id: PeripheralId, rssi: i16) {
        let callback = self.inner.lock().unwrap().callback.clone();
        if let Some(cb) = callback {
            cb(id, rssi);
        }
    }

    /// Attempt to start scanning given the radio's current power state.
    ///
    /// Returns `true` if the caller should actually issue the
    /// scan-for-peripherals request to the radio adapter now; `false` means
    /// the request was buffered (radio not yet `poweredOn`) or a scan was
    /// already active.
    pub fn try_start(&self, power: PowerState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.scanning {
            debug!("start_scanning: already scanning");
            return false;
        }
        if power != PowerState::PoweredOn {
            info!(?power, "start_scanning: radio not powered on, buffering request");
            inner.pending_scan_request = true;
            return false;
        }
        inner.scanning = true;
        inner.pending_scan_request = false;
        true
    }

    /// Called when the radio transitions to `poweredOn`. Returns `true` if
    /// a buffered request should now be issued.
    pub fn take_pending_on_power_on(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_scan_request {
            inner.pending_scan_request = false;
            inner.scanning = true;
            true
        } else {
            false
        }
    }

    /// Stop scanning and clear any buffered request.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.scanning = false;
        inner.pending_scan_request = false;
    }
}
