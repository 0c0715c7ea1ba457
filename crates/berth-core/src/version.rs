//! Version stamps.
//!
//! Every config or scale change of a run spec (and every root group write)
//! produces a new `Timestamp`. Timestamps are strictly totally ordered and
//! serialize as RFC 3339 offset date-times.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A monotonically-increasing version instant. Immutable value type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt)
    }

    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        Ok(Timestamp(
            DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc),
        ))
    }

    pub fn as_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// The fixed instant `epoch + millis`. Doubles as the stamp of
    /// unversioned entities.
    pub fn at_millis(millis: i64) -> Self {
        Timestamp(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_rfc3339())
    }
}

/// Version metadata of a run spec.
///
/// `Full` distinguishes the last scaling change from the last config change;
/// `version` is always the newer of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionInfo {
    NoVersion,
    OnlyVersion(Timestamp),
    Full {
        version: Timestamp,
        last_scaling_at: Timestamp,
        last_config_change_at: Timestamp,
    },
}

impl VersionInfo {
    /// Version info for a freshly created spec.
    pub fn for_new_config(now: Timestamp) -> Self {
        VersionInfo::Full {
            version: now,
            last_scaling_at: now,
            last_config_change_at: now,
        }
    }

    pub fn version(&self) -> Option<Timestamp> {
        match self {
            VersionInfo::NoVersion => None,
            VersionInfo::OnlyVersion(v) => Some(*v),
            VersionInfo::Full { version, .. } => Some(*version),
        }
    }

    /// A scale-only change: `version` and `last_scaling_at` move, the config
    /// stamp stays.
    pub fn with_scaling_change(self, now: Timestamp) -> Self {
        match self {
            VersionInfo::Full {
                last_config_change_at,
                ..
            } => VersionInfo::Full {
                version: now,
                last_scaling_at: now,
                last_config_change_at,
            },
            _ => VersionInfo::for_new_config(now),
        }
    }

    /// A config change: all three stamps move.
    pub fn with_config_change(self, now: Timestamp) -> Self {
        VersionInfo::for_new_config(now)
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        VersionInfo::NoVersion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_totally_ordered() {
        let a = Timestamp::at_millis(1);
        let b = Timestamp::at_millis(2);
        assert!(a < b);
        assert_eq!(a, Timestamp::at_millis(1));
    }

    #[test]
    fn rfc3339_round_trip() {
        let ts = Timestamp::at_millis(1_500_000_000_123);
        let back = Timestamp::parse(&ts.as_rfc3339()).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn serializes_as_offset_datetime() {
        let ts = Timestamp::at_millis(0);
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.contains("1970-01-01"), "got {json}");
    }

    #[test]
    fn scaling_change_keeps_config_stamp() {
        let t0 = Timestamp::at_millis(0);
        let t1 = Timestamp::at_millis(1000);
        let info = VersionInfo::for_new_config(t0).with_scaling_change(t1);
        match info {
            VersionInfo::Full {
                version,
                last_scaling_at,
                last_config_change_at,
            } => {
                assert_eq!(version, t1);
                assert_eq!(last_scaling_at, t1);
                assert_eq!(last_config_change_at, t0);
                assert!(last_config_change_at <= version);
                assert!(last_scaling_at <= version);
            }
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn config_change_moves_all_stamps() {
        let t0 = Timestamp::at_millis(0);
        let t1 = Timestamp::at_millis(1000);
        let info = VersionInfo::for_new_config(t0).with_config_change(t1);
        assert_eq!(info, VersionInfo::for_new_config(t1));
    }
}
