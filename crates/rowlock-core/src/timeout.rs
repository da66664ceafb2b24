//! Wait budgets and lease durations.

use std::time::{Duration, Instant};

/// Represents how long a caller is prepared to wait for a lock.
///
/// - `Some(duration)` - Wait up to this duration
/// - `None` - Wait indefinitely
pub type Timeout = Option<Duration>;

/// Internal helper for wait-budget calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutValue {
    millis: i64, // -1 for infinite
}

impl TimeoutValue {
    pub const INFINITE: Self = Self { millis: -1 };
    pub const ZERO: Self = Self { millis: 0 };

    pub fn is_infinite(&self) -> bool {
        self.millis < 0
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn as_duration(&self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_millis(self.millis as u64))
        }
    }

    /// Absolute deadline for a wait that started at `start`; `None` when infinite.
    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        self.as_duration()
            .map(|d| start.checked_add(d).unwrap_or_else(|| start + Duration::from_secs(u32::MAX as u64)))
    }
}

impl From<Option<Duration>> for TimeoutValue {
    fn from(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::INFINITE,
            Some(d) => Self {
                millis: d.as_millis().min(i64::MAX as u128) as i64,
            },
        }
    }
}

/// How long an acquired lock stays valid without renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lease {
    /// The client's configured default lease.
    #[default]
    Default,
    /// A caller-chosen lease; the record simply expires after it.
    Fixed(Duration),
    /// Hold until `unlock`: the default lease is written and the watchdog
    /// keeps extending it.
    AutoExtend,
}

impl Lease {
    /// Builds a lease from milliseconds; any negative value selects
    /// [`Lease::AutoExtend`], matching the `-1` convention of lease-based lock APIs.
    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            Lease::AutoExtend
        } else {
            Lease::Fixed(Duration::from_millis(millis as u64))
        }
    }

    pub fn is_auto_extend(&self) -> bool {
        matches!(self, Lease::AutoExtend)
    }

    /// The duration written to the lock record.
    pub fn effective(&self, default_lease: Duration) -> Duration {
        match self {
            Lease::Fixed(d) => *d,
            Lease::Default | Lease::AutoExtend => default_lease,
        }
    }
}
