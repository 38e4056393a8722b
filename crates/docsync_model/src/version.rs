//! Timestamps and snapshot versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time with nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: i64,
    nanos: i32,
}

impl Timestamp {
    /// Creates a timestamp, normalizing `nanos` into `0..1_000_000_000`.
    #[must_use]
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let extra = i64::from(nanos.div_euclid(1_000_000_000));
        Self {
            seconds: seconds + extra,
            nanos: nanos.rem_euclid(1_000_000_000),
        }
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::new(elapsed.as_secs() as i64, elapsed.subsec_nanos() as i32)
    }

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self::new(
            millis.div_euclid(1000),
            (millis.rem_euclid(1000) * 1_000_000) as i32,
        )
    }

    /// Seconds since the epoch.
    #[must_use]
    pub const fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Sub-second nanoseconds.
    #[must_use]
    pub const fn nanos(&self) -> i32 {
        self.nanos
    }

    /// Milliseconds since the epoch (truncated).
    #[must_use]
    pub fn to_millis(&self) -> i64 {
        self.seconds * 1000 + i64::from(self.nanos / 1_000_000)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// A logical version assigned by the server to a consistent snapshot.
///
/// Versions are monotonically comparable. [`SnapshotVersion::MIN`] means
/// "no version known".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    /// The smallest possible version.
    pub const MIN: SnapshotVersion = SnapshotVersion(Timestamp {
        seconds: 0,
        nanos: 0,
    });

    /// Wraps a timestamp.
    #[must_use]
    pub const fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Creates a version from milliseconds since the epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(Timestamp::from_millis(millis))
    }

    /// Returns the underlying timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.0
    }

    /// Returns true for [`SnapshotVersion::MIN`].
    #[must_use]
    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
