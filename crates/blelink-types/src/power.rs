//! Bluetooth radio power state.

use std::fmt;

/// State of the local Bluetooth radio, as reported by the platform.
///
/// Observed, not owned: the connection state machine reacts to transitions
/// but never drives this value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PowerState {
    /// Initial state before the platform has reported anything.
    Unknown,
    /// The radio is mid-reset; treat like `Unknown` and keep waiting.
    Resetting,
    /// The platform has no Bluetooth radio at all. Permanent for the process.
    Unsupported,
    /// The application lacks the OS permission to use Bluetooth.
    Unauthorized,
    /// The radio is present but switched off.
    PoweredOff,
    /// The radio is on and usable.
    PoweredOn,
}

impl PowerState {
    /// Whether this state permits issuing connect/scan requests.
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// Whether this state can never transition to [`PowerState::PoweredOn`].
    pub const fn is_permanent_failure(self) -> bool {
        matches!(self, Self::Unsupported | Self::Unauthorized)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "poweredOff",
            Self::PoweredOn => "poweredOn",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_usable() {
        assert!(PowerState::PoweredOn.is_usable());
        assert!(!PowerState::PoweredOff.is_usable());
        assert!(!PowerState::Unknown.is_usable());
    }

    #[test]
    fn test_is_permanent_failure() {
        assert!(PowerState::Unsupported.is_permanent_failure());
        assert!(PowerState::Unauthorized.is_permanent_failure());
        assert!(!PowerState::PoweredOff.is_permanent_failure());
        assert!(!PowerState::Resetting.is_permanent_failure());
    }

    #[test]
    fn test_display() {
        assert_eq!(PowerState::PoweredOn.to_string(), "poweredOn");
        assert_eq!(PowerState::PoweredOff.to_string(), "poweredOff");
        assert_eq!(PowerState::Unauthorized.to_string(), "unauthorized");
    }
}
