//! The four lock tables on MySQL (InnoDB).

use std::time::Duration;

use chrono::{DateTime, Utc};
use rowlock_core::error::{LockError, LockResult};
use rowlock_core::record::{AcquireOutcome, LockRecord, NotificationEvent, ReleaseOutcome, WaitEntry};
use rowlock_core::store::{LockRecordStore, LockStore, NotificationLog, SequenceCounter, WaitRegistry};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

/// Lock store over a MySQL pool.
///
/// Affected-row counts are "found rows" (the driver sets `CLIENT_FOUND_ROWS`),
/// so an update that writes an unchanged value still reports a match.
#[derive(Clone)]
pub struct MySqlLockStore {
    pool: MySqlPool,
}

impl MySqlLockStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn lease_micros(lease: Duration) -> i64 {
    i64::try_from(lease.as_micros()).unwrap_or(i64::MAX)
}

fn decode<'r, T>(row: &'r MySqlRow, column: &str) -> LockResult<T>
where
    T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>,
{
    row.try_get(column)
        .map_err(|e| LockError::store(&format!("failed to decode {column}"), e))
}

fn count(row: &MySqlRow) -> LockResult<u32> {
    let count: i32 = decode(row, "reentrant_count")?;
    Ok(count.max(0) as u32)
}

fn held(row: &MySqlRow) -> LockResult<AcquireOutcome> {
    Ok(AcquireOutcome::Held {
        holder: decode(row, "holder")?,
        expire_at: decode(row, "expire_time")?,
    })
}

impl LockRecordStore for MySqlLockStore {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> LockResult<AcquireOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::connection("failed to start acquire transaction", e))?;

        let row = sqlx::query(
            "SELECT holder, expire_time, reentrant_count,
                    CAST(expire_time < NOW(3) AS SIGNED) AS expired
             FROM distributed_lock WHERE lock_key = ? FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::store("failed to read lock row", e))?;

        let outcome = match row {
            None => {
                let inserted = sqlx::query(
                    "INSERT IGNORE INTO distributed_lock (lock_key, holder, expire_time, reentrant_count)
                     VALUES (?, ?, DATE_ADD(NOW(3), INTERVAL ? MICROSECOND), 1)",
                )
                .bind(key)
                .bind(holder)
                .bind(lease_micros(lease))
                .execute(&mut *tx)
                .await
                .map_err(|e| LockError::store("failed to insert lock row", e))?
                .rows_affected();

                if inserted == 1 {
                    AcquireOutcome::Acquired
                } else {
                    let winner = sqlx::query(
                        "SELECT holder, expire_time FROM distributed_lock WHERE lock_key = ?",
                    )
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to read lock row", e))?;
                    match winner {
                        Some(row) => held(&row)?,
                        None => AcquireOutcome::Held {
                            holder: String::new(),
                            expire_at: Utc::now(),
                        },
                    }
                }
            }
            Some(row) => {
                let expired: i64 = decode(&row, "expired")?;
                let current: String = decode(&row, "holder")?;

                if expired != 0 {
                    let updated = sqlx::query(
                        "UPDATE distributed_lock
                         SET holder = ?, expire_time = DATE_ADD(NOW(3), INTERVAL ? MICROSECOND), reentrant_count = 1
                         WHERE lock_key = ? AND expire_time < NOW(3)",
                    )
                    .bind(holder)
                    .bind(lease_micros(lease))
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to take over expired lock row", e))?
                    .rows_affected();
                    if updated == 1 {
                        AcquireOutcome::Acquired
                    } else {
                        held(&row)?
                    }
                } else if current == holder {
                    sqlx::query(
                        "UPDATE distributed_lock
                         SET reentrant_count = reentrant_count + 1,
                             expire_time = DATE_ADD(NOW(3), INTERVAL ? MICROSECOND)
                         WHERE lock_key = ? AND holder = ?",
                    )
                    .bind(lease_micros(lease))
                    .bind(key)
                    .bind(holder)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to re-enter lock row", e))?;
                    let row = sqlx::query(
                        "SELECT reentrant_count FROM distributed_lock WHERE lock_key = ? AND holder = ?",
                    )
                    .bind(key)
                    .bind(holder)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to read lock row", e))?;
                    AcquireOutcome::Reentered { count: count(&row)? }
                } else {
                    held(&row)?
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| LockError::store("failed to commit acquire transaction", e))?;
        Ok(outcome)
    }

    async fn release(&self, key: &str, holder: &str, lease: Duration) -> LockResult<ReleaseOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::connection("failed to start release transaction", e))?;

        let row = sqlx::query(
            "SELECT reentrant_count FROM distributed_lock WHERE lock_key = ? AND holder = ? FOR UPDATE",
        )
        .bind(key)
        .bind(holder)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::store("failed to read lock row", e))?;

        let outcome = match row {
            None => ReleaseOutcome::NotHeld,
            Some(row) => {
                let current = count(&row)?;
                if current > 1 {
                    sqlx::query(
                        "UPDATE distributed_lock
                         SET reentrant_count = reentrant_count - 1,
                             expire_time = DATE_ADD(NOW(3), INTERVAL ? MICROSECOND)
                         WHERE lock_key = ? AND holder = ?",
                    )
                    .bind(lease_micros(lease))
                    .bind(key)
                    .bind(holder)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to decrement lock row", e))?;
                    ReleaseOutcome::Decremented {
                        remaining: current - 1,
                    }
                } else {
                    sqlx::query("DELETE FROM distributed_lock WHERE lock_key = ? AND holder = ?")
                        .bind(key)
                        .bind(holder)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| LockError::store("failed to delete lock row", e))?;
                    ReleaseOutcome::Released
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| LockError::store("failed to commit release transaction", e))?;
        Ok(outcome)
    }

    async fn extend(&self, key: &str, holder: &str, lease: Duration) -> LockResult<bool> {
        let updated = sqlx::query(
            "UPDATE distributed_lock SET expire_time = DATE_ADD(NOW(3), INTERVAL ? MICROSECOND)
             WHERE lock_key = ? AND holder = ?",
        )
        .bind(lease_micros(lease))
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to extend lock row", e))?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT lock_key, holder, expire_time, reentrant_count FROM distributed_lock WHERE lock_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to read lock row", e))?;

        row.map(|row| {
            Ok(LockRecord {
                lock_key: decode(&row, "lock_key")?,
                holder: decode(&row, "holder")?,
                expire_at: decode(&row, "expire_time")?,
                reentrant_count: count(&row)?,
            })
        })
        .transpose()
    }

    async fn delete_expired(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        let deleted = sqlx::query("DELETE FROM distributed_lock WHERE expire_time < ? LIMIT ?")
            .bind(threshold)
            .bind(limit)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to delete expired lock rows", e))?
            .rows_affected();
        Ok(deleted)
    }
}

impl SequenceCounter for MySqlLockStore {
    async fn next_ticket(&self, key: &str) -> LockResult<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::connection("failed to start sequence transaction", e))?;

        sqlx::query(
            "INSERT INTO lock_sequence (lock_key, current_sequence) VALUES (?, 1)
             ON DUPLICATE KEY UPDATE current_sequence = current_sequence + 1",
        )
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::store("failed to advance lock sequence", e))?;

        // The upsert holds the row lock until commit, so this reads our own value.
        let ticket: i64 = sqlx::query_scalar("SELECT current_sequence FROM lock_sequence WHERE lock_key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| LockError::store("failed to read lock sequence", e))?;

        tx.commit()
            .await
            .map_err(|e| LockError::store("failed to commit sequence transaction", e))?;
        Ok(ticket)
    }
}

impl NotificationLog for MySqlLockStore {
    async fn publish(&self, key: &str, ticket: i64) -> LockResult<()> {
        sqlx::query("INSERT IGNORE INTO lock_notify (lock_key, sequence, notify_time) VALUES (?, ?, NOW(3))")
            .bind(key)
            .bind(ticket)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to publish notification", e))?;
        Ok(())
    }

    async fn events_after(&self, key: &str, after: i64) -> LockResult<Vec<NotificationEvent>> {
        let rows = sqlx::query(
            "SELECT lock_key, sequence, notify_time FROM lock_notify
             WHERE lock_key = ? AND sequence > ? ORDER BY sequence",
        )
        .bind(key)
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to read notifications", e))?;

        rows.iter()
            .map(|row| {
                Ok(NotificationEvent {
                    lock_key: decode(row, "lock_key")?,
                    sequence: decode(row, "sequence")?,
                    notified_at: decode(row, "notify_time")?,
                })
            })
            .collect()
    }

    async fn contains(&self, key: &str, ticket: i64) -> LockResult<bool> {
        let found: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM lock_notify WHERE lock_key = ? AND sequence = ?")
                .bind(key)
                .bind(ticket)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| LockError::store("failed to look up notification", e))?;
        Ok(found > 0)
    }

    async fn prune(&self, key: &str, up_to: i64) -> LockResult<u64> {
        let deleted = sqlx::query("DELETE FROM lock_notify WHERE lock_key = ? AND sequence <= ?")
            .bind(key)
            .bind(up_to)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to prune notifications", e))?
            .rows_affected();
        Ok(deleted)
    }

    async fn delete_before(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        let deleted = sqlx::query("DELETE FROM lock_notify WHERE notify_time < ? LIMIT ?")
            .bind(threshold)
            .bind(limit)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to delete old notifications", e))?
            .rows_affected();
        Ok(deleted)
    }
}

impl WaitRegistry for MySqlLockStore {
    async fn register(&self, entry: &WaitEntry) -> LockResult<()> {
        sqlx::query(
            "INSERT INTO lock_wait_queue (lock_key, sequence, instance_id, create_time, expire_time)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE expire_time = VALUES(expire_time), instance_id = VALUES(instance_id)",
        )
        .bind(&entry.lock_key)
        .bind(entry.sequence)
        .bind(&entry.instance_id)
        .bind(entry.created_at)
        .bind(entry.expire_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to register wait", e))?;
        Ok(())
    }

    async fn touch(&self, key: &str, ticket: i64, expire_at: DateTime<Utc>) -> LockResult<bool> {
        let updated = sqlx::query("UPDATE lock_wait_queue SET expire_time = ? WHERE lock_key = ? AND sequence = ?")
            .bind(expire_at)
            .bind(key)
            .bind(ticket)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to refresh wait", e))?
            .rows_affected();
        Ok(updated > 0)
    }

    async fn remove(&self, key: &str, ticket: i64) -> LockResult<bool> {
        let deleted = sqlx::query("DELETE FROM lock_wait_queue WHERE lock_key = ? AND sequence = ?")
            .bind(key)
            .bind(ticket)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to remove wait", e))?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn min_ticket(&self, key: &str, now: DateTime<Utc>) -> LockResult<Option<i64>> {
        sqlx::query_scalar("SELECT MIN(sequence) FROM lock_wait_queue WHERE lock_key = ? AND expire_time >= ?")
            .bind(key)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to find next waiter", e))
    }

    async fn purge_expired(&self, key: &str, now: DateTime<Utc>) -> LockResult<u64> {
        let deleted = sqlx::query("DELETE FROM lock_wait_queue WHERE lock_key = ? AND expire_time < ?")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to purge expired waits", e))?
            .rows_affected();
        Ok(deleted)
    }

    async fn exists(&self, key: &str, ticket: i64, instance_id: &str) -> LockResult<bool> {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM lock_wait_queue WHERE lock_key = ? AND sequence = ? AND instance_id = ?",
        )
        .bind(key)
        .bind(ticket)
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to look up wait", e))?;
        Ok(found > 0)
    }
}

impl LockStore for MySqlLockStore {
    fn backend_name(&self) -> &'static str {
        "mysql"
    }
}
