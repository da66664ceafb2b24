//! An in-process store with the same transactional semantics as the SQL
//! backends. Every operation runs under one mutex, which plays the part of the
//! row lock. Useful for tests, benches and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rowlock_core::error::LockResult;
use rowlock_core::record::{
    AcquireOutcome, LockRecord, NotificationEvent, ReleaseOutcome, WaitEntry, expiry_after,
};
use rowlock_core::store::{LockRecordStore, LockStore, NotificationLog, SequenceCounter, WaitRegistry};

#[derive(Default)]
struct Tables {
    records: HashMap<String, LockRecord>,
    sequences: HashMap<String, i64>,
    notifications: BTreeMap<(String, i64), NotificationEvent>,
    waits: BTreeMap<(String, i64), WaitEntry>,
}

/// Lock store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a record as-is, replacing any existing row for its key.
    pub fn insert_record(&self, record: LockRecord) {
        self.tables
            .lock()
            .records
            .insert(record.lock_key.clone(), record);
    }

    /// Writes a notification with an explicit timestamp.
    pub fn insert_notification(&self, event: NotificationEvent) {
        self.tables
            .lock()
            .notifications
            .insert((event.lock_key.clone(), event.sequence), event);
    }

    pub fn records(&self) -> Vec<LockRecord> {
        self.tables.lock().records.values().cloned().collect()
    }

    pub fn record(&self, key: &str) -> Option<LockRecord> {
        self.tables.lock().records.get(key).cloned()
    }

    pub fn wait_entries(&self, key: &str) -> Vec<WaitEntry> {
        self.tables
            .lock()
            .waits
            .values()
            .filter(|w| w.lock_key == key)
            .cloned()
            .collect()
    }

    pub fn notifications(&self, key: &str) -> Vec<NotificationEvent> {
        self.tables
            .lock()
            .notifications
            .values()
            .filter(|n| n.lock_key == key)
            .cloned()
            .collect()
    }
}

impl LockRecordStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> LockResult<AcquireOutcome> {
        let now = Utc::now();
        let expire_at = expiry_after(now, lease);
        let mut tables = self.tables.lock();

        let Some(record) = tables.records.get_mut(key) else {
            tables.records.insert(
                key.to_string(),
                LockRecord {
                    lock_key: key.to_string(),
                    holder: holder.to_string(),
                    expire_at,
                    reentrant_count: 1,
                },
            );
            return Ok(AcquireOutcome::Acquired);
        };

        if record.is_expired_at(now) {
            record.holder = holder.to_string();
            record.expire_at = expire_at;
            record.reentrant_count = 1;
            return Ok(AcquireOutcome::Acquired);
        }

        if record.holder == holder {
            record.reentrant_count += 1;
            record.expire_at = expire_at;
            return Ok(AcquireOutcome::Reentered {
                count: record.reentrant_count,
            });
        }

        Ok(AcquireOutcome::Held {
            holder: record.holder.clone(),
            expire_at: record.expire_at,
        })
    }

    async fn release(&self, key: &str, holder: &str, lease: Duration) -> LockResult<ReleaseOutcome> {
        let now = Utc::now();
        let mut tables = self.tables.lock();

        let Some(record) = tables.records.get_mut(key).filter(|r| r.holder == holder) else {
            return Ok(ReleaseOutcome::NotHeld);
        };

        if record.reentrant_count > 1 {
            record.reentrant_count -= 1;
            record.expire_at = expiry_after(now, lease);
            return Ok(ReleaseOutcome::Decremented {
                remaining: record.reentrant_count,
            });
        }

        tables.records.remove(key);
        Ok(ReleaseOutcome::Released)
    }

    async fn extend(&self, key: &str, holder: &str, lease: Duration) -> LockResult<bool> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        match tables.records.get_mut(key) {
            Some(record) if record.holder == holder => {
                record.expire_at = expiry_after(now, lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>> {
        Ok(self.record(key))
    }

    async fn delete_expired(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        let mut tables = self.tables.lock();
        let doomed: Vec<String> = tables
            .records
            .values()
            .filter(|r| r.expire_at < threshold)
            .take(limit as usize)
            .map(|r| r.lock_key.clone())
            .collect();
        for key in &doomed {
            tables.records.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

impl SequenceCounter for MemoryLockStore {
    async fn next_ticket(&self, key: &str) -> LockResult<i64> {
        let mut tables = self.tables.lock();
        let value = tables.sequences.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

impl NotificationLog for MemoryLockStore {
    async fn publish(&self, key: &str, ticket: i64) -> LockResult<()> {
        self.insert_notification(NotificationEvent {
            lock_key: key.to_string(),
            sequence: ticket,
            notified_at: Utc::now(),
        });
        Ok(())
    }

    async fn events_after(&self, key: &str, after: i64) -> LockResult<Vec<NotificationEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .notifications
            .range((key.to_string(), after.saturating_add(1))..=(key.to_string(), i64::MAX))
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn contains(&self, key: &str, ticket: i64) -> LockResult<bool> {
        Ok(self
            .tables
            .lock()
            .notifications
            .contains_key(&(key.to_string(), ticket)))
    }

    async fn prune(&self, key: &str, up_to: i64) -> LockResult<u64> {
        let mut tables = self.tables.lock();
        let before = tables.notifications.len();
        tables
            .notifications
            .retain(|(k, sequence), _| k != key || *sequence > up_to);
        Ok((before - tables.notifications.len()) as u64)
    }

    async fn delete_before(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        let mut tables = self.tables.lock();
        let doomed: Vec<(String, i64)> = tables
            .notifications
            .iter()
            .filter(|(_, event)| event.notified_at < threshold)
            .take(limit as usize)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            tables.notifications.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

impl WaitRegistry for MemoryLockStore {
    async fn register(&self, entry: &WaitEntry) -> LockResult<()> {
        self.tables
            .lock()
            .waits
            .insert((entry.lock_key.clone(), entry.sequence), entry.clone());
        Ok(())
    }

    async fn touch(&self, key: &str, ticket: i64, expire_at: DateTime<Utc>) -> LockResult<bool> {
        let mut tables = self.tables.lock();
        match tables.waits.get_mut(&(key.to_string(), ticket)) {
            Some(entry) => {
                entry.expire_at = expire_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &str, ticket: i64) -> LockResult<bool> {
        Ok(self
            .tables
            .lock()
            .waits
            .remove(&(key.to_string(), ticket))
            .is_some())
    }

    async fn min_ticket(&self, key: &str, now: DateTime<Utc>) -> LockResult<Option<i64>> {
        let tables = self.tables.lock();
        Ok(tables
            .waits
            .range((key.to_string(), i64::MIN)..=(key.to_string(), i64::MAX))
            .find(|(_, entry)| entry.expire_at >= now)
            .map(|((_, ticket), _)| *ticket))
    }

    async fn purge_expired(&self, key: &str, now: DateTime<Utc>) -> LockResult<u64> {
        let mut tables = self.tables.lock();
        let before = tables.waits.len();
        tables
            .waits
            .retain(|(k, _), entry| k != key || entry.expire_at >= now);
        Ok((before - tables.waits.len()) as u64)
    }

    async fn exists(&self, key: &str, ticket: i64, instance_id: &str) -> LockResult<bool> {
        Ok(self
            .tables
            .lock()
            .waits
            .get(&(key.to_string(), ticket))
            .is_some_and(|entry| entry.instance_id == instance_id))
    }
}

impl LockStore for MemoryLockStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
