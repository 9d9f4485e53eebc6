//! Timestamp value object and the explicit "now or at" start marker.

use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ValidationError;

/// Immutable point in time, always UTC, at whole-second precision.
///
/// The ledger speaks Unix seconds, so sub-second precision is dropped on
/// construction to keep equality comparisons against ledger values exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    pub fn now() -> Self {
        Self(Utc::now().trunc_subsecs(0))
    }

    /// Creates a timestamp from a DateTime<Utc>.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.trunc_subsecs(0))
    }

    /// Creates a timestamp from Unix seconds.
    pub fn from_unix(secs: i64) -> Result<Self, ValidationError> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .map(Self)
            .ok_or_else(|| ValidationError::invalid_format("timestamp", format!("{} out of range", secs)))
    }

    /// Returns the inner DateTime.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Returns the timestamp as Unix seconds.
    pub fn as_unix(&self) -> i64 {
        self.0.timestamp()
    }

    /// Checks if this timestamp is before another.
    pub fn is_before(&self, other: &Timestamp) -> bool {
        self.0 < other.0
    }

    /// Checks if this timestamp is after another.
    pub fn is_after(&self, other: &Timestamp) -> bool {
        self.0 > other.0
    }

    /// Creates a new timestamp by adding the specified number of days.
    pub fn add_days(&self, days: i64) -> Self {
        Self(self.0 + Duration::days(days))
    }

    /// Creates a new timestamp by adding the specified number of seconds.
    pub fn add_secs(&self, secs: i64) -> Self {
        Self(self.0 + Duration::seconds(secs))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// When something takes effect: as soon as the ledger processes the
/// request, or at a specific instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "at")]
pub enum Effective {
    #[default]
    Immediate,
    At(Timestamp),
}

impl Effective {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Effective::Immediate)
    }

    /// The concrete instant, if one was given.
    pub fn at(&self) -> Option<Timestamp> {
        match self {
            Effective::Immediate => None,
            Effective::At(ts) => Some(*ts),
        }
    }

    /// Resolves against a reference "now".
    pub fn resolve(&self, now: Timestamp) -> Timestamp {
        self.at().unwrap_or(now)
    }
}

impl From<Timestamp> for Effective {
    fn from(ts: Timestamp) -> Self {
        Effective::At(ts)
    }
}

impl fmt::Display for Effective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effective::Immediate => f.write_str("now"),
            Effective::At(ts) => write!(f, "{}", ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn timestamp_now_has_whole_seconds() {
        let ts = Timestamp::now();
        assert_eq!(ts.as_datetime().nanosecond(), 0);
    }

    #[test]
    fn timestamp_from_unix_round_trips() {
        // 2024-01-15T00:00:00Z
        let ts = Timestamp::from_unix(1705276800).unwrap();
        assert_eq!(ts.as_datetime().year(), 2024);
        assert_eq!(ts.as_datetime().month(), 1);
        assert_eq!(ts.as_datetime().day(), 15);
        assert_eq!(ts.as_unix(), 1705276800);
    }

    #[test]
    fn timestamp_from_unix_rejects_out_of_range() {
        assert!(Timestamp::from_unix(i64::MAX).is_err());
    }

    #[test]
    fn timestamp_ordering_works() {
        let ts1 = Timestamp::from_unix(1000).unwrap();
        let ts2 = ts1.add_secs(60);
        assert!(ts1 < ts2);
        assert!(ts1.is_before(&ts2));
        assert!(ts2.is_after(&ts1));
        assert_eq!(ts2.as_unix(), 1060);
    }

    #[test]
    fn effective_resolves_against_now() {
        let now = Timestamp::from_unix(5000).unwrap();
        let later = now.add_days(1);
        assert_eq!(Effective::Immediate.resolve(now), now);
        assert_eq!(Effective::At(later).resolve(now), later);
        assert!(Effective::default().is_immediate());
    }

    #[test]
    fn effective_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Effective::Immediate).unwrap();
        assert_eq!(json, r#"{"kind":"immediate"}"#);
    }
}
