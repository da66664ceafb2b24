//! Periodic deletion of long-expired lock records and old notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rowlock_core::error::LockResult;
use rowlock_core::store::LockStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::options::ReaperOptions;

/// Rows removed by one reaper run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub records: u64,
    pub notifications: u64,
}

/// Lifetime counters of a reaper.
#[derive(Debug, Default)]
pub struct ReaperStats {
    runs: AtomicU64,
    failures: AtomicU64,
    records: AtomicU64,
    notifications: AtomicU64,
}

impl ReaperStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn records_deleted(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn notifications_deleted(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

/// Deletes lock records whose lease ended more than `retention` ago.
pub struct Reaper<S: LockStore> {
    store: S,
    options: ReaperOptions,
    stats: Arc<ReaperStats>,
}

impl<S: LockStore> Clone for Reaper<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            options: self.options.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: LockStore> Reaper<S> {
    pub fn new(store: S, options: ReaperOptions) -> LockResult<Self> {
        options.validate()?;
        Ok(Self {
            store,
            options,
            stats: Arc::new(ReaperStats::default()),
        })
    }

    pub fn options(&self) -> &ReaperOptions {
        &self.options
    }

    pub fn stats(&self) -> &ReaperStats {
        &self.stats
    }

    /// Records expiring before this instant are eligible for deletion.
    pub fn threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.options.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One pass over both tables, in batches, without touching the counters.
    pub async fn run_once(&self) -> LockResult<ReapReport> {
        let threshold = self.threshold(Utc::now());
        let batch = self.options.batch_size;
        let mut report = ReapReport::default();

        loop {
            let deleted = self.store.delete_expired(threshold, batch).await?;
            report.records += deleted;
            if deleted < u64::from(batch) {
                break;
            }
            debug!(deleted, "reaper batch done");
            tokio::time::sleep(self.options.batch_pause).await;
        }

        loop {
            let deleted = self.store.delete_before(threshold, batch).await?;
            report.notifications += deleted;
            if deleted < u64::from(batch) {
                break;
            }
            tokio::time::sleep(self.options.batch_pause).await;
        }

        Ok(report)
    }

    /// Runs the reaper now and accounts for the outcome. This is the manual
    /// entry point for operators.
    #[instrument(skip(self), fields(backend = self.store.backend_name(), retention = ?self.options.retention))]
    pub async fn trigger(&self) -> LockResult<ReapReport> {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        counter!("rowlock.reaper.runs").increment(1);

        match self.run_once().await {
            Ok(report) => {
                self.stats.records.fetch_add(report.records, Ordering::Relaxed);
                self.stats
                    .notifications
                    .fetch_add(report.notifications, Ordering::Relaxed);
                counter!("rowlock.reaper.records_deleted").increment(report.records);
                counter!("rowlock.reaper.notifications_deleted").increment(report.notifications);
                info!(
                    records = report.records,
                    notifications = report.notifications,
                    "expired lock records reaped"
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                counter!("rowlock.reaper.failures").increment(1);
                error!(error = %e, "reaper run failed; will retry at the next scheduled run");
                Err(e)
            }
        }
    }

    /// Runs the reaper on its schedule until the handle is aborted.
    ///
    /// Returns `None` when the reaper is disabled.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        if !self.options.enabled {
            info!("reaper disabled");
            return None;
        }
        let reaper = self.clone();
        Some(tokio::spawn(async move {
            info!(schedule = %reaper.options.schedule, "reaper scheduled");
            loop {
                let delay = reaper.options.schedule.next_delay(Utc::now());
                tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                let _ = reaper.trigger().await;
            }
        }))
    }
}
