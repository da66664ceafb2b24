//! Loading lock and reaper settings from a file and the environment.
//!
//! Keys are grouped into a `lock` and a `reaper` table; durations are plain
//! milliseconds. Environment variables use the `ROWLOCK` prefix with `__`
//! between path segments, e.g. `ROWLOCK__LOCK__DEFAULT_LEASE_MS=10000` or
//! `ROWLOCK__REAPER__SCHEDULE=03:30`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use rowlock_core::error::{LockError, LockResult};
use serde::Deserialize;

use crate::options::{LockOptions, ReapSchedule, ReaperOptions};

pub const ENV_PREFIX: &str = "ROWLOCK";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub lock: LockSection,
    pub reaper: ReaperSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub default_lease_ms: u64,
    pub renewal_ratio: u32,
    pub watchdog_pool_size: usize,
    pub notify_poll_interval_ms: u64,
    pub waiter_expiry_factor: f64,
    pub waiter_sweep_interval_ms: u64,
    pub recheck_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        let d = LockOptions::default();
        Self {
            default_lease_ms: d.default_lease.as_millis() as u64,
            renewal_ratio: d.renewal_ratio,
            watchdog_pool_size: d.watchdog_pool_size,
            notify_poll_interval_ms: d.notify_poll_interval.as_millis() as u64,
            waiter_expiry_factor: d.waiter_expiry_factor,
            waiter_sweep_interval_ms: d.waiter_sweep_interval.as_millis() as u64,
            recheck_interval_ms: d.recheck_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperSection {
    pub enabled: bool,
    pub retention_days: u64,
    pub batch_size: u32,
    pub batch_pause_ms: u64,
    pub schedule: String,
}

impl Default for ReaperSection {
    fn default() -> Self {
        let d = ReaperOptions::default();
        Self {
            enabled: d.enabled,
            retention_days: d.retention.as_secs() / 86_400,
            batch_size: d.batch_size,
            batch_pause_ms: d.batch_pause.as_millis() as u64,
            schedule: d.schedule.to_string(),
        }
    }
}

impl LockSettings {
    /// Reads settings from `path` (if given and present) overlaid with
    /// `ROWLOCK__*` environment variables.
    pub fn load(path: Option<&Path>) -> LockResult<Self> {
        Self::load_with(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> LockResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(environment)
            .build()
            .and_then(|c| c.try_deserialize::<LockSettings>())
            .map_err(|e| LockError::Config(e.to_string()))
    }

    pub fn lock_options(&self) -> LockResult<LockOptions> {
        let s = &self.lock;
        let options = LockOptions {
            default_lease: Duration::from_millis(s.default_lease_ms),
            renewal_ratio: s.renewal_ratio,
            watchdog_pool_size: s.watchdog_pool_size,
            notify_poll_interval: Duration::from_millis(s.notify_poll_interval_ms),
            waiter_expiry_factor: s.waiter_expiry_factor,
            waiter_sweep_interval: Duration::from_millis(s.waiter_sweep_interval_ms),
            recheck_interval: Duration::from_millis(s.recheck_interval_ms),
            ..LockOptions::default()
        };
        options.validate()?;
        Ok(options)
    }

    pub fn reaper_options(&self) -> LockResult<ReaperOptions> {
        let s = &self.reaper;
        let retention = s.retention_days.checked_mul(86_400).ok_or_else(|| {
            LockError::Config(format!("reaper retention of {} days is too large", s.retention_days))
        })?;
        let options = ReaperOptions {
            enabled: s.enabled,
            retention: Duration::from_secs(retention),
            batch_size: s.batch_size,
            batch_pause: Duration::from_millis(s.batch_pause_ms),
            schedule: s.schedule.parse::<ReapSchedule>()?,
        };
        options.validate()?;
        Ok(options)
    }
}
