//! Time types for QUARRY.
//!
//! Wall clock timestamps are used for lock heartbeats and document
//! metadata. Ordering and monotonic reasoning uses `std::time::Instant`
//! at the call sites; these values only travel through files.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall clock timestamp, serialized as RFC 3339 in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Get current timestamp
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create from milliseconds since the Unix epoch
    ///
    /// # Errors
    ///
    /// Returns error if the value is out of range
    pub fn from_millis(millis: i64) -> CoreResult<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| CoreError::InvalidTimestamp {
                reason: format!("{} ms is out of range", millis),
            })
    }

    /// Parse an RFC 3339 string
    ///
    /// # Errors
    ///
    /// Returns error if the string is not valid RFC 3339
    pub fn parse(raw: &str) -> CoreResult<Self> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| CoreError::InvalidTimestamp {
                reason: format!("{}: {}", raw, e),
            })
    }

    /// Milliseconds since the Unix epoch
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Time elapsed between this timestamp and `now`
    ///
    /// Timestamps in the future report zero age.
    #[must_use]
    pub fn age_at(&self, now: Timestamp) -> Duration {
        let delta = now.as_millis().saturating_sub(self.as_millis());
        Duration::from_millis(u64::try_from(delta).unwrap_or(0))
    }

    /// Time elapsed since this timestamp
    #[must_use]
    pub fn age(&self) -> Duration {
        self.age_at(Self::now())
    }

    /// Shift forward by a duration
    #[must_use]
    pub fn plus(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        Self(self.0 + delta)
    }

    /// Access the inner chrono value
    #[must_use]
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}
