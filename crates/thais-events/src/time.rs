use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical shard time in millisecond ticks since the shard clock started.
///
/// Logical time only moves forward and is independent of wall-clock changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalTime(u64);

impl LogicalTime {
    pub const ZERO: LogicalTime = LogicalTime(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Offset by a non-negative number of milliseconds, saturating at the end of time.
    pub fn after_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub fn after(self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.after_millis(millis)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: LogicalTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}ms", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}
