//! The persistence boundary of the lock.
//!
//! Four logical tables back every lock: the lock records themselves, a
//! per-key ticket counter, an append-only notification log and a registry of
//! outstanding waits. Backends implement all four traits over a single
//! relational store; each method is one short transaction of its own that
//! never joins a caller's transaction.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::LockResult;
use crate::name::MAX_KEY_LENGTH;
use crate::record::{AcquireOutcome, LockRecord, NotificationEvent, ReleaseOutcome, WaitEntry};

// ============================================================================
// Lock records
// ============================================================================

/// Row-per-key ownership records.
pub trait LockRecordStore: Send + Sync {
    /// Runs the acquisition transaction for `holder`.
    ///
    /// Reads the row with an exclusive row lock, then:
    /// - no row: inserts one with count 1 and `expire_at = now + lease`;
    /// - expired row: takes it over, guarded by the same expiry predicate;
    /// - row held by `holder`: increments the count and refreshes the expiry;
    /// - otherwise reports who holds it and until when.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<AcquireOutcome>> + Send;

    /// Runs the release transaction: decrements the count (refreshing the
    /// expiry by `lease`) or deletes the row when it reaches zero.
    fn release(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<ReleaseOutcome>> + Send;

    /// Pushes `expire_at` to `now + lease` if `holder` still owns the row.
    ///
    /// Returns `false` when no row was updated.
    fn extend(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<bool>> + Send;

    /// Reads the current row for `key`, expired or not.
    fn get(&self, key: &str) -> impl Future<Output = LockResult<Option<LockRecord>>> + Send;

    /// Deletes at most `limit` rows whose `expire_at` is before `threshold`.
    fn delete_expired(
        &self,
        threshold: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = LockResult<u64>> + Send;

    /// Width of the key column; longer keys are encoded to fit.
    fn max_key_length(&self) -> usize {
        MAX_KEY_LENGTH
    }
}

// ============================================================================
// Sequence counter
// ============================================================================

/// Strictly increasing per-key ticket numbers.
pub trait SequenceCounter: Send + Sync {
    /// Creates the counter row if absent, increments it and returns the new value.
    fn next_ticket(&self, key: &str) -> impl Future<Output = LockResult<i64>> + Send;
}

// ============================================================================
// Notification log
// ============================================================================

/// Append-only per-key log of "ticket N may proceed" events.
pub trait NotificationLog: Send + Sync {
    /// Appends an event naming `ticket`.
    fn publish(&self, key: &str, ticket: i64) -> impl Future<Output = LockResult<()>> + Send;

    /// Events for `key` with a sequence greater than `after`, in ascending order.
    fn events_after(
        &self,
        key: &str,
        after: i64,
    ) -> impl Future<Output = LockResult<Vec<NotificationEvent>>> + Send;

    /// Whether an event naming `ticket` exists.
    fn contains(&self, key: &str, ticket: i64) -> impl Future<Output = LockResult<bool>> + Send;

    /// Deletes events for `key` with a sequence up to and including `up_to`.
    fn prune(&self, key: &str, up_to: i64) -> impl Future<Output = LockResult<u64>> + Send;

    /// Deletes at most `limit` events of any key written before `threshold`.
    fn delete_before(
        &self,
        threshold: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = LockResult<u64>> + Send;
}

// ============================================================================
// Wait registry
// ============================================================================

/// Outstanding `(key, ticket)` waits with an expiry.
pub trait WaitRegistry: Send + Sync {
    fn register(&self, entry: &WaitEntry) -> impl Future<Output = LockResult<()>> + Send;

    /// Moves the expiry of a live entry; `false` if the entry is gone.
    fn touch(
        &self,
        key: &str,
        ticket: i64,
        expire_at: DateTime<Utc>,
    ) -> impl Future<Output = LockResult<bool>> + Send;

    fn remove(&self, key: &str, ticket: i64) -> impl Future<Output = LockResult<bool>> + Send;

    /// Lowest ticket for `key` whose entry has not expired at `now`.
    fn min_ticket(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = LockResult<Option<i64>>> + Send;

    /// Removes entries for `key` that expired before `now`.
    fn purge_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = LockResult<u64>> + Send;

    fn exists(
        &self,
        key: &str,
        ticket: i64,
        instance_id: &str,
    ) -> impl Future<Output = LockResult<bool>> + Send;
}

/// Everything the lock machinery needs from a backend.
pub trait LockStore:
    LockRecordStore + SequenceCounter + NotificationLog + WaitRegistry + Clone + 'static
{
    /// Name used in log fields.
    fn backend_name(&self) -> &'static str;
}
