//! Stable peripheral identity.

use std::fmt;

/// A platform-stable identifier for a peripheral.
///
/// On most platforms this is the string form of the adapter's peripheral
/// UUID or MAC address. The connection state machine treats it as opaque:
/// it is used only for equality checks against the currently-connected
/// peripheral and as a cache key for retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap a platform-reported identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeripheralId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PeripheralId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PeripheralId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_by_value() {
        let a = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        let b = PeripheralId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_ids() {
        let a = PeripheralId::new("device-1");
        let b = PeripheralId::new("device-2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        let id = PeripheralId::new("device-1");
        assert_eq!(id.to_string(), "device-1");
        assert_eq!(id.as_str(), "device-1");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_roundtrip() {
        let id = PeripheralId::new("device-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"device-1\"");
        let parsed: PeripheralId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
