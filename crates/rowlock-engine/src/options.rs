//! Tunables for lock clients and the reaper.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use rowlock_core::error::{LockError, LockResult};

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease written for `Lease::Default` and `Lease::AutoExtend`.
    pub default_lease: Duration,
    /// The watchdog renews every `lease / renewal_ratio`.
    pub renewal_ratio: u32,
    /// Maximum number of renewal round-trips in flight at once.
    pub watchdog_pool_size: usize,
    /// How often a key's poller reads the notification log.
    pub notify_poll_interval: Duration,
    /// Wait entries live for `lease * waiter_expiry_factor` past each slice.
    pub waiter_expiry_factor: f64,
    /// Period of the expired-waiter sweep.
    pub waiter_sweep_interval: Duration,
    /// Longest a waiter sleeps before re-checking the record on its own.
    pub recheck_interval: Duration,
    /// Backoff bounds after a failed (indeterminate) acquisition attempt.
    pub min_busy_wait: Duration,
    pub max_busy_wait: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(30),
            renewal_ratio: 3,
            watchdog_pool_size: 4,
            notify_poll_interval: Duration::from_millis(50),
            waiter_expiry_factor: 1.5,
            waiter_sweep_interval: Duration::from_secs(30),
            recheck_interval: Duration::from_secs(5),
            min_busy_wait: Duration::from_millis(50),
            max_busy_wait: Duration::from_secs(1),
        }
    }
}

impl LockOptions {
    /// Renewal period for a lease.
    pub fn renewal_interval(&self, lease: Duration) -> Duration {
        lease / self.renewal_ratio.max(1)
    }

    /// How long a wait entry must outlive the slice it was touched for.
    pub fn waiter_grace(&self, lease: Duration) -> Duration {
        lease.mul_f64(self.waiter_expiry_factor)
    }

    pub fn validate(&self) -> LockResult<()> {
        if self.default_lease.is_zero() {
            return Err(LockError::Config("default lease must be positive".into()));
        }
        // Two renewals must fit in one lease so a single missed cycle is harmless.
        if self.renewal_ratio < 2 {
            return Err(LockError::Config(format!(
                "renewal ratio must be at least 2, got {}",
                self.renewal_ratio
            )));
        }
        if self.watchdog_pool_size == 0 {
            return Err(LockError::Config("watchdog pool size must be positive".into()));
        }
        if self.notify_poll_interval.is_zero() || self.recheck_interval.is_zero() {
            return Err(LockError::Config(
                "poll and recheck intervals must be positive".into(),
            ));
        }
        if self.waiter_sweep_interval.is_zero() {
            return Err(LockError::Config("waiter sweep interval must be positive".into()));
        }
        if !(self.waiter_expiry_factor >= 1.0) {
            return Err(LockError::Config(format!(
                "waiter expiry factor must be at least 1.0, got {}",
                self.waiter_expiry_factor
            )));
        }
        if self.min_busy_wait > self.max_busy_wait {
            return Err(LockError::Config("min busy wait exceeds max busy wait".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Reaper
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReaperOptions {
    pub enabled: bool,
    /// Records expired for longer than this are deleted.
    pub retention: Duration,
    pub batch_size: u32,
    /// Pause between two delete batches.
    pub batch_pause: Duration,
    pub schedule: ReapSchedule,
}

impl Default for ReaperOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: Duration::from_secs(7 * 24 * 3600),
            batch_size: 1000,
            batch_pause: Duration::from_millis(100),
            schedule: ReapSchedule::default(),
        }
    }
}

impl ReaperOptions {
    pub fn validate(&self) -> LockResult<()> {
        if self.batch_size == 0 {
            return Err(LockError::Config("reaper batch size must be positive".into()));
        }
        if let ReapSchedule::Every(d) = self.schedule
            && d.is_zero()
        {
            return Err(LockError::Config("reaper interval must be positive".into()));
        }
        Ok(())
    }
}

/// When the reaper runs.
///
/// Parsed from either a time of day `HH:MM[:SS]` (daily, UTC) or an interval
/// `<n>s`, `<n>m`, `<n>h`, `<n>d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapSchedule {
    DailyAt(NaiveTime),
    Every(Duration),
}

impl Default for ReapSchedule {
    fn default() -> Self {
        ReapSchedule::DailyAt(NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN))
    }
}

impl ReapSchedule {
    /// Time from `now` until the next run.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            ReapSchedule::Every(interval) => interval,
            ReapSchedule::DailyAt(at) => {
                let today = now.date_naive().and_time(at).and_utc();
                let next = if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

impl FromStr for ReapSchedule {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            return NaiveTime::parse_from_str(s, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .map(ReapSchedule::DailyAt)
                .map_err(|e| LockError::Config(format!("invalid reaper time of day {s:?}: {e}")));
        }

        let invalid = || LockError::Config(format!("invalid reaper schedule {s:?}"));
        let unit_at = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        let (amount, unit) = s.split_at(unit_at);
        let amount: u64 = amount.parse().map_err(|_| invalid())?;
        let scale: u64 = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => return Err(invalid()),
        };
        let seconds = amount.checked_mul(scale).ok_or_else(invalid)?;
        Ok(ReapSchedule::Every(Duration::from_secs(seconds)))
    }
}

impl fmt::Display for ReapSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapSchedule::DailyAt(at) => write!(f, "{}", at.format("%H:%M:%S")),
            ReapSchedule::Every(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_are_valid() {
        LockOptions::default().validate().unwrap();
        ReaperOptions::default().validate().unwrap();
        assert_eq!(
            LockOptions::default().renewal_interval(Duration::from_secs(30)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn renewal_ratio_below_two_is_rejected() {
        let options = LockOptions {
            renewal_ratio: 1,
            ..LockOptions::default()
        };
        assert!(matches!(options.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn schedule_parses_time_of_day_and_intervals() {
        assert_eq!(
            "02:00".parse::<ReapSchedule>().unwrap(),
            ReapSchedule::DailyAt(NaiveTime::from_hms_opt(2, 0, 0).unwrap())
        );
        assert_eq!(
            "23:30:15".parse::<ReapSchedule>().unwrap(),
            ReapSchedule::DailyAt(NaiveTime::from_hms_opt(23, 30, 15).unwrap())
        );
        assert_eq!(
            "6h".parse::<ReapSchedule>().unwrap(),
            ReapSchedule::Every(Duration::from_secs(6 * 3600))
        );
        assert!("soon".parse::<ReapSchedule>().is_err());
        assert!("10w".parse::<ReapSchedule>().is_err());
        assert!("25:00".parse::<ReapSchedule>().is_err());
    }

    #[test]
    fn oversized_interval_is_a_config_error() {
        assert!(matches!(
            "300000000000000d".parse::<ReapSchedule>(),
            Err(LockError::Config(_))
        ));
        assert!(matches!(
            "99999999999999999999s".parse::<ReapSchedule>(),
            Err(LockError::Config(_))
        ));
    }

    #[test]
    fn daily_schedule_waits_for_next_occurrence() {
        let schedule = ReapSchedule::default();
        let before = Utc.with_ymd_and_hms(2026, 3, 1, 1, 30, 0).unwrap();
        assert_eq!(schedule.next_delay(before), Duration::from_secs(30 * 60));

        let after = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(schedule.next_delay(after), Duration::from_secs(24 * 3600));
    }
}
