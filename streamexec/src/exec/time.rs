// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Engine time representation

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Time = Time(i64::MIN);
    pub const MAX: Time = Time(i64::MAX);

    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        // Out-of-range timestamps saturate at the ends of the representable range.
        match dt.timestamp_nanos_opt() {
            Some(nanos) => Time(nanos),
            None if dt.timestamp() < 0 => Time::MIN,
            None => Time::MAX,
        }
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    pub fn nanos(self) -> i64 {
        self.0
    }

    /// Add a signed nanosecond offset, saturating at the range ends
    pub fn saturating_add(self, nanos: i64) -> Self {
        Time(self.0.saturating_add(nanos))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Time::MIN => f.write_str("-inf"),
            Time::MAX => f.write_str("+inf"),
            t => write!(f, "{}", t.to_datetime().to_rfc3339()),
        }
    }
}

/// Half-open time window `[start, stop)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub start: Time,
    pub stop: Time,
}

impl Bounds {
    pub fn new(start: Time, stop: Time) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, t: Time) -> bool {
        self.start <= t && t < self.stop
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t = Time::from_datetime(&dt);
        assert_eq!(t.to_datetime(), dt);
    }

    #[test]
    fn test_bounds_half_open() {
        let b = Bounds::new(Time(10), Time(20));
        assert!(b.contains(Time(10)));
        assert!(!b.contains(Time(20)));
        assert!(Bounds::new(Time(5), Time(5)).is_empty());
    }

    #[test]
    fn test_display_infinities() {
        assert_eq!(Time::MIN.to_string(), "-inf");
        assert_eq!(Time::MAX.to_string(), "+inf");
    }
}
