//! Generation fencing: rejecting stale platform callbacks.
//!
//! Callbacks from the platform BLE stack may be delivered arbitrarily
//! late — observed tens of seconds after app resume, occasionally
//! minutes. The fence rejects stale callbacks using two complementary
//! checks: peripheral identity, and a generation-stamped timestamp
//! comparison with a tolerance for wall-clock jumps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use blelink_types::PeripheralId;

/// Monotonic connection-generation counter paired with the wall-clock
/// instant the current generation began.
///
/// A new generation is created on entry to `Connecting`, on entry to
/// `AutoReconnecting`, and when OS state restoration triggers a reconnect.
/// The counter and its boundary timestamp are mutated only by the state
/// machine core, never by callback handlers directly.
#[derive(Debug)]
pub struct GenerationFence {
    current: AtomicU64,
    start: std::sync::Mutex<Instant>,
    tolerance: Duration,
}

impl GenerationFence {
    /// Create a fence starting at generation 0 (pre-first-connect).
    pub fn new(tolerance: Duration) -> Self {
        Self {
            current: AtomicU64::new(0),
            start: std::sync::Mutex::new(Instant::now()),
            tolerance,
        }
    }

    /// Advance to a new generation, stamping the current instant as its
    /// boundary. Returns the new generation value.
    pub fn advance(&self) -> u64 {
        let next = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        *self.start.lock().unwrap() = Instant::now();
        next
    }

    /// The currently-live generation.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// The instant the current generation began.
    pub fn start_instant(&self) -> Instant {
        *self.start.lock().unwrap()
    }

    /// Reject a timer-driven callback (timeout task) armed under a
    /// different generation than the one currently live.
    pub fn validate_generation_tag(&self, tag: u64) -> bool {
        tag == self.current()
    }

    /// Reject a disconnect callback whose platform-reported event instant
    /// predates the current generation's start by more than `tolerance`.
    ///
    /// Implements `event_timestamp + tolerance < generation_start_timestamp`
    /// ⇒ reject. `event_timestamp` is the platform-reported instant the
    /// disconnect occurred, which may be well before delivery time.
    pub fn validate_event_timestamp(&self, event_timestamp: Instant) -> bool {
        event_timestamp + self.tolerance >= self.start_instant()
    }

    /// Reject a callback whose peripheral identity does not match the
    /// peripheral associated with the current phase.
    pub fn validate_peripheral(
        &self,
        callback_id: &PeripheralId,
        current_id: &PeripheralId,
    ) -> bool {
        callback_id == current_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use proptest::prelude::*;

    #[test]
    fn test_advance_increments_monotonically() {
        let fence = GenerationFence::new(Duration::from_secs(1));
        assert_eq!(fence.current(), 0);
        assert_eq!(fence.advance(), 1);
        assert_eq!(fence.advance(), 2);
        assert_eq!(fence.current(), 2);
    }

    #[test]
    fn test_generation_tag_validation() {
        let fence = GenerationFence::new(Duration::from_secs(1));
        fence.advance();
        assert!(fence.validate_generation_tag(1));
        assert!(!fence.validate_generation_tag(0));
        assert!(!fence.validate_generation_tag(2));
    }

    #[test]
    fn test_peripheral_identity_rejects_mismatch() {
        let fence = GenerationFence::new(Duration::from_secs(1));
        let a = PeripheralId::new("device-a");
        let b = PeripheralId::new("device-b");
        assert!(fence.validate_peripheral(&a, &a));
        assert!(!fence.validate_peripheral(&a, &b));
    }

    #[test]
    fn test_event_at_generation_start_is_accepted() {
        let fence = GenerationFence::new(Duration::from_millis(100));
        fence.advance();
        let start = fence.start_instant();
        assert!(fence.validate_event_timestamp(start));
    }

    #[test]
    fn test_event_before_generation_start_within_tolerance_is_accepted() {
        let fence = GenerationFence::new(Duration::from_millis(100));
        fence.advance();
        let start = fence.start_instant();
        let event = start - Duration::from_millis(50);
        assert!(fence.validate_event_timestamp(event));
    }

    #[test]
    fn test_event_well_before_generation_start_is_rejected() {
        let fence = GenerationFence::new(Duration::from_millis(100));
        fence.advance();
        sleep(Duration::from_millis(10));
        let start = fence.start_instant();
        let event = start - Duration::from_secs(5);
        assert!(!fence.validate_event_timestamp(event));
    }

    proptest! {
        /// Property 3 of the testable-properties list: an event timestamp
        /// is accepted iff it falls within `tolerance` of the generation's
        /// start, regardless of how far in the future or past it is
        /// otherwise — the boundary is exact, not approximate.
        #[test]
        fn prop_event_timestamp_accepted_iff_within_tolerance(offset_ms in 0u64..10_000) {
            let tolerance = Duration::from_millis(100);
            let fence = GenerationFence::new(tolerance);
            fence.advance();
            let start = fence.start_instant();
            let event = start - Duration::from_millis(offset_ms);
            let accepted = fence.validate_event_timestamp(event);
            prop_assert_eq!(accepted, offset_ms <= tolerance.as_millis() as u64);
        }
    }
}
