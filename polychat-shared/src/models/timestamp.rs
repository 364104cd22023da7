//! Wall-clock timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// UTC instant serialized as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero.
    #[must_use]
    pub fn millis_since(&self, earlier: &Timestamp) -> u64 {
        u64::try_from((self.0 - earlier.0).num_milliseconds()).unwrap_or(0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_formatting() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 8, 14, 30, 0).unwrap();
        assert_eq!(Timestamp(dt).to_string(), "2025-03-08 14:30:00");
    }

    #[test]
    fn test_timestamp_serialization() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 8, 14, 30, 0).unwrap();
        let serialized = serde_json::to_string(&Timestamp(dt)).unwrap();

        assert_eq!(serialized, "\"2025-03-08T14:30:00Z\"");
    }

    #[test]
    fn test_millis_since_clamps_negative() {
        let early = Timestamp(Utc.with_ymd_and_hms(2025, 3, 8, 14, 30, 0).unwrap());
        let late = Timestamp(Utc.with_ymd_and_hms(2025, 3, 8, 14, 30, 2).unwrap());

        assert_eq!(late.millis_since(&early), 2_000);
        assert_eq!(early.millis_since(&late), 0);
    }
}
