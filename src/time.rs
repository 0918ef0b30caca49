//! Millisecond-resolution timestamps used by every timed component.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A point in time, in milliseconds since an arbitrary epoch.
///
/// The engine never reads a wall clock; every timestamp arrives with the
/// event that carries it, which keeps replays deterministic.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ilc_engine::time::Timestamp;
///
/// let t = Timestamp::from_secs(60);
/// assert_eq!(t + Duration::from_secs(30), Timestamp::from_secs(90));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from whole milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Creates a timestamp from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1000)
    }

    /// Creates a timestamp from fractional minutes.
    pub fn from_minutes(minutes: f64) -> Self {
        Self((minutes * 60_000.0).round() as i64)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Signed number of seconds from `earlier` to `self`.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / 1000.0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}s", self.as_secs_f64())
    }
}

/// Converts configured minutes into a `Duration`, treating negatives as zero.
pub fn minutes(value: f64) -> Duration {
    Duration::from_secs_f64((value * 60.0).max(0.0))
}

/// Converts configured hours into a `Duration`, treating negatives as zero.
pub fn hours(value: f64) -> Duration {
    Duration::from_secs_f64((value * 3600.0).max(0.0))
}
