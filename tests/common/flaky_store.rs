//! A [`MemoryLockStore`] wrapper that fails on demand.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rowlock::{
    AcquireOutcome, LockError, LockRecord, LockRecordStore, LockResult, LockStore,
    MemoryLockStore, NotificationEvent, NotificationLog, ReleaseOutcome, SequenceCounter,
    WaitEntry, WaitRegistry,
};

#[derive(Default)]
struct Faults {
    /// Upcoming `try_acquire` calls that fail before reaching the store.
    acquire_failures: AtomicU32,
    /// Upcoming `try_acquire` calls that commit and then report an error.
    lost_acknowledgements: AtomicU32,
    /// Every `try_acquire` fails while set.
    store_down: AtomicBool,
    /// `extend` reports that no row matched while set.
    refuse_extend: AtomicBool,
    /// `extend` fails with a store error while set.
    extend_errors: AtomicBool,
    /// Keys whose `purge_expired` fails.
    purge_failures: Mutex<Vec<String>>,
    acquire_calls: AtomicU32,
}

#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryLockStore,
    faults: Arc<Faults>,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected(context: &str) -> LockError {
    LockError::store(context, "injected failure")
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryLockStore {
        &self.inner
    }

    pub fn fail_next_acquires(&self, n: u32) {
        self.faults.acquire_failures.store(n, Ordering::SeqCst);
    }

    pub fn lose_next_acknowledgements(&self, n: u32) {
        self.faults.lost_acknowledgements.store(n, Ordering::SeqCst);
    }

    pub fn set_store_down(&self, down: bool) {
        self.faults.store_down.store(down, Ordering::SeqCst);
    }

    pub fn refuse_extend(&self, refuse: bool) {
        self.faults.refuse_extend.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_extend(&self, fail: bool) {
        self.faults.extend_errors.store(fail, Ordering::SeqCst);
    }

    pub fn fail_purge_for(&self, keys: &[&str]) {
        *self.faults.purge_failures.lock().unwrap() = keys.iter().map(|k| k.to_string()).collect();
    }

    pub fn acquire_calls(&self) -> u32 {
        self.faults.acquire_calls.load(Ordering::SeqCst)
    }
}

impl LockRecordStore for FlakyStore {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> LockResult<AcquireOutcome> {
        self.faults.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.store_down.load(Ordering::SeqCst) || take(&self.faults.acquire_failures) {
            return Err(injected("failed to read lock row"));
        }
        let outcome = self.inner.try_acquire(key, holder, lease).await?;
        if take(&self.faults.lost_acknowledgements) {
            return Err(injected("failed to commit acquire transaction"));
        }
        Ok(outcome)
    }

    async fn release(&self, key: &str, holder: &str, lease: Duration) -> LockResult<ReleaseOutcome> {
        self.inner.release(key, holder, lease).await
    }

    async fn extend(&self, key: &str, holder: &str, lease: Duration) -> LockResult<bool> {
        if self.faults.extend_errors.load(Ordering::SeqCst) {
            return Err(injected("failed to extend lock row"));
        }
        if self.faults.refuse_extend.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.extend(key, holder, lease).await
    }

    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>> {
        self.inner.get(key).await
    }

    async fn delete_expired(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        self.inner.delete_expired(threshold, limit).await
    }
}

impl SequenceCounter for FlakyStore {
    async fn next_ticket(&self, key: &str) -> LockResult<i64> {
        self.inner.next_ticket(key).await
    }
}

impl NotificationLog for FlakyStore {
    async fn publish(&self, key: &str, ticket: i64) -> LockResult<()> {
        self.inner.publish(key, ticket).await
    }

    async fn events_after(&self, key: &str, after: i64) -> LockResult<Vec<NotificationEvent>> {
        self.inner.events_after(key, after).await
    }

    async fn contains(&self, key: &str, ticket: i64) -> LockResult<bool> {
        self.inner.contains(key, ticket).await
    }

    async fn prune(&self, key: &str, up_to: i64) -> LockResult<u64> {
        self.inner.prune(key, up_to).await
    }

    async fn delete_before(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        self.inner.delete_before(threshold, limit).await
    }
}

impl WaitRegistry for FlakyStore {
    async fn register(&self, entry: &WaitEntry) -> LockResult<()> {
        self.inner.register(entry).await
    }

    async fn touch(&self, key: &str, ticket: i64, expire_at: DateTime<Utc>) -> LockResult<bool> {
        self.inner.touch(key, ticket, expire_at).await
    }

    async fn remove(&self, key: &str, ticket: i64) -> LockResult<bool> {
        self.inner.remove(key, ticket).await
    }

    async fn min_ticket(&self, key: &str, now: DateTime<Utc>) -> LockResult<Option<i64>> {
        self.inner.min_ticket(key, now).await
    }

    async fn purge_expired(&self, key: &str, now: DateTime<Utc>) -> LockResult<u64> {
        if self.faults.purge_failures.lock().unwrap().iter().any(|k| k == key) {
            return Err(injected("failed to purge wait entries"));
        }
        self.inner.purge_expired(key, now).await
    }

    async fn exists(&self, key: &str, ticket: i64, instance_id: &str) -> LockResult<bool> {
        self.inner.exists(key, ticket, instance_id).await
    }
}

impl LockStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
