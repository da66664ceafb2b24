//! The four lock tables on PostgreSQL.
//!
//! Expiry arithmetic uses the database clock (`now()`), so lease decisions do
//! not depend on the clocks of the competing processes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rowlock_core::error::{LockError, LockResult};
use rowlock_core::record::{AcquireOutcome, LockRecord, NotificationEvent, ReleaseOutcome, WaitEntry};
use rowlock_core::store::{LockRecordStore, LockStore, NotificationLog, SequenceCounter, WaitRegistry};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Lock store over a PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn lease_millis(lease: Duration) -> f64 {
    lease.as_secs_f64() * 1000.0
}

fn count(row: &PgRow) -> LockResult<u32> {
    let count: i32 = row
        .try_get("reentrant_count")
        .map_err(|e| LockError::store("failed to decode reentrant count", e))?;
    Ok(count.max(0) as u32)
}

fn held(row: &PgRow) -> LockResult<AcquireOutcome> {
    Ok(AcquireOutcome::Held {
        holder: row
            .try_get("holder")
            .map_err(|e| LockError::store("failed to decode holder", e))?,
        expire_at: row
            .try_get("expire_time")
            .map_err(|e| LockError::store("failed to decode expire time", e))?,
    })
}

impl LockRecordStore for PostgresLockStore {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> LockResult<AcquireOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::connection("failed to start acquire transaction", e))?;

        let row = sqlx::query(
            "SELECT holder, expire_time, reentrant_count, expire_time < now() AS expired
             FROM distributed_lock WHERE lock_key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::store("failed to read lock row", e))?;

        let outcome = match row {
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO distributed_lock (lock_key, holder, expire_time, reentrant_count)
                     VALUES ($1, $2, now() + $3::float8 * interval '1 millisecond', 1)
                     ON CONFLICT (lock_key) DO NOTHING",
                )
                .bind(key)
                .bind(holder)
                .bind(lease_millis(lease))
                .execute(&mut *tx)
                .await
                .map_err(|e| LockError::store("failed to insert lock row", e))?
                .rows_affected();

                if inserted == 1 {
                    AcquireOutcome::Acquired
                } else {
                    // A concurrent acquirer inserted first.
                    let winner = sqlx::query(
                        "SELECT holder, expire_time FROM distributed_lock WHERE lock_key = $1",
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
                let expired: bool = row
                    .try_get("expired")
                    .map_err(|e| LockError::store("failed to decode expiry", e))?;
                let current: String = row
                    .try_get("holder")
                    .map_err(|e| LockError::store("failed to decode holder", e))?;

                if expired {
                    let updated = sqlx::query(
                        "UPDATE distributed_lock
                         SET holder = $2, expire_time = now() + $3::float8 * interval '1 millisecond', reentrant_count = 1
                         WHERE lock_key = $1 AND expire_time < now()",
                    )
                    .bind(key)
                    .bind(holder)
                    .bind(lease_millis(lease))
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
                    let row = sqlx::query(
                        "UPDATE distributed_lock
                         SET reentrant_count = reentrant_count + 1,
                             expire_time = now() + $3::float8 * interval '1 millisecond'
                         WHERE lock_key = $1 AND holder = $2
                         RETURNING reentrant_count",
                    )
                    .bind(key)
                    .bind(holder)
                    .bind(lease_millis(lease))
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to re-enter lock row", e))?;
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
            "SELECT reentrant_count FROM distributed_lock
             WHERE lock_key = $1 AND holder = $2 FOR UPDATE",
        )
        .bind(key)
        .bind(holder)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::store("failed to read lock row", e))?;

        let outcome = match row {
            None => ReleaseOutcome::NotHeld,
            Some(row) if count(&row)? > 1 => {
                let row = sqlx::query(
                    "UPDATE distributed_lock
                     SET reentrant_count = reentrant_count - 1,
                         expire_time = now() + $3::float8 * interval '1 millisecond'
                     WHERE lock_key = $1 AND holder = $2
                     RETURNING reentrant_count",
                )
                .bind(key)
                .bind(holder)
                .bind(lease_millis(lease))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| LockError::store("failed to decrement lock row", e))?;
                ReleaseOutcome::Decremented {
                    remaining: count(&row)?,
                }
            }
            Some(_) => {
                sqlx::query("DELETE FROM distributed_lock WHERE lock_key = $1 AND holder = $2")
                    .bind(key)
                    .bind(holder)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LockError::store("failed to delete lock row", e))?;
                ReleaseOutcome::Released
            }
        };

        tx.commit()
            .await
            .map_err(|e| LockError::store("failed to commit release transaction", e))?;
        Ok(outcome)
    }

    async fn extend(&self, key: &str, holder: &str, lease: Duration) -> LockResult<bool> {
        let updated = sqlx::query(
            "UPDATE distributed_lock SET expire_time = now() + $3::float8 * interval '1 millisecond'
             WHERE lock_key = $1 AND holder = $2",
        )
        .bind(key)
        .bind(holder)
        .bind(lease_millis(lease))
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to extend lock row", e))?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT lock_key, holder, expire_time, reentrant_count FROM distributed_lock WHERE lock_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to read lock row", e))?;

        row.map(|row| {
            Ok(LockRecord {
                lock_key: row
                    .try_get("lock_key")
                    .map_err(|e| LockError::store("failed to decode lock key", e))?,
                holder: row
                    .try_get("holder")
                    .map_err(|e| LockError::store("failed to decode holder", e))?,
                expire_at: row
                    .try_get("expire_time")
                    .map_err(|e| LockError::store("failed to decode expire time", e))?,
                reentrant_count: count(&row)?,
            })
        })
        .transpose()
    }

    async fn delete_expired(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        let deleted = sqlx::query(
            "DELETE FROM distributed_lock WHERE id IN (
                SELECT id FROM distributed_lock WHERE expire_time < $1 LIMIT $2
             )",
        )
        .bind(threshold)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to delete expired lock rows", e))?
        .rows_affected();
        Ok(deleted)
    }
}

impl SequenceCounter for PostgresLockStore {
    async fn next_ticket(&self, key: &str) -> LockResult<i64> {
        sqlx::query_scalar(
            "INSERT INTO lock_sequence (lock_key, current_sequence) VALUES ($1, 1)
             ON CONFLICT (lock_key) DO UPDATE SET current_sequence = lock_sequence.current_sequence + 1
             RETURNING current_sequence",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to advance lock sequence", e))
    }
}

impl NotificationLog for PostgresLockStore {
    async fn publish(&self, key: &str, ticket: i64) -> LockResult<()> {
        sqlx::query(
            "INSERT INTO lock_notify (lock_key, sequence, notify_time) VALUES ($1, $2, now())
             ON CONFLICT (lock_key, sequence) DO NOTHING",
        )
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
             WHERE lock_key = $1 AND sequence > $2 ORDER BY sequence",
        )
        .bind(key)
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to read notifications", e))?;

        rows.iter()
            .map(|row| {
                Ok(NotificationEvent {
                    lock_key: row
                        .try_get("lock_key")
                        .map_err(|e| LockError::store("failed to decode lock key", e))?,
                    sequence: row
                        .try_get("sequence")
                        .map_err(|e| LockError::store("failed to decode sequence", e))?,
                    notified_at: row
                        .try_get("notify_time")
                        .map_err(|e| LockError::store("failed to decode notify time", e))?,
                })
            })
            .collect()
    }

    async fn contains(&self, key: &str, ticket: i64) -> LockResult<bool> {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM lock_notify WHERE lock_key = $1 AND sequence = $2",
        )
        .bind(key)
        .bind(ticket)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to look up notification", e))?;
        Ok(found > 0)
    }

    async fn prune(&self, key: &str, up_to: i64) -> LockResult<u64> {
        let deleted = sqlx::query("DELETE FROM lock_notify WHERE lock_key = $1 AND sequence <= $2")
            .bind(key)
            .bind(up_to)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to prune notifications", e))?
            .rows_affected();
        Ok(deleted)
    }

    async fn delete_before(&self, threshold: DateTime<Utc>, limit: u32) -> LockResult<u64> {
        let deleted = sqlx::query(
            "DELETE FROM lock_notify WHERE id IN (
                SELECT id FROM lock_notify WHERE notify_time < $1 LIMIT $2
             )",
        )
        .bind(threshold)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to delete old notifications", e))?
        .rows_affected();
        Ok(deleted)
    }
}

impl WaitRegistry for PostgresLockStore {
    async fn register(&self, entry: &WaitEntry) -> LockResult<()> {
        sqlx::query(
            "INSERT INTO lock_wait_queue (lock_key, sequence, instance_id, create_time, expire_time)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (lock_key, sequence)
             DO UPDATE SET instance_id = EXCLUDED.instance_id, expire_time = EXCLUDED.expire_time",
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
        let updated = sqlx::query(
            "UPDATE lock_wait_queue SET expire_time = $3 WHERE lock_key = $1 AND sequence = $2",
        )
        .bind(key)
        .bind(ticket)
        .bind(expire_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to refresh wait", e))?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn remove(&self, key: &str, ticket: i64) -> LockResult<bool> {
        let deleted = sqlx::query("DELETE FROM lock_wait_queue WHERE lock_key = $1 AND sequence = $2")
            .bind(key)
            .bind(ticket)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store("failed to remove wait", e))?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn min_ticket(&self, key: &str, now: DateTime<Utc>) -> LockResult<Option<i64>> {
        sqlx::query_scalar(
            "SELECT MIN(sequence) FROM lock_wait_queue WHERE lock_key = $1 AND expire_time >= $2",
        )
        .bind(key)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LockError::store("failed to find next waiter", e))
    }

    async fn purge_expired(&self, key: &str, now: DateTime<Utc>) -> LockResult<u64> {
        let deleted = sqlx::query("DELETE FROM lock_wait_queue WHERE lock_key = $1 AND expire_time < $2")
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
            "SELECT COUNT(*) FROM lock_wait_queue
             WHERE lock_key = $1 AND sequence = $2 AND instance_id = $3",
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

impl LockStore for PostgresLockStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
