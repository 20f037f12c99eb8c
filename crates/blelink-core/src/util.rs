//! Small shared helpers.

use blelink_types::PeripheralId;

/// Truncate a peripheral id for compact log lines, keeping enough of the
/// tail to disambiguate devices sharing a common prefix.
pub fn short_id(id: &PeripheralId) -> String {
    let s = id.as_str();
    if s.len() <= 12 {
        s.to_string()
    } else {
        format!("...{}", &s[s.len() - 8..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_passes_through_short_ids() {
        let id = PeripheralId::new("dev-1");
        assert_eq!(short_id(&id), "dev-1");
    }

    #[test]
    fn test_short_id_truncates_long_ids() {
        let id = PeripheralId::new("12345678-90ab-cdef-1234-567890abcdef");
        assert_eq!(short_id(&id), "...90abcdef");
    }
}
