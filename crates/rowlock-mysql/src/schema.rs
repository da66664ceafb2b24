//! Table definitions for the MySQL lock store.
//!
//! Timestamps are `DATETIME(3)` in UTC; the driver pins the session time zone
//! to `+00:00`, so `NOW(3)` and bound `DateTime<Utc>` values agree.

use rowlock_core::error::{LockError, LockResult};
use sqlx::MySqlPool;
use tracing::info;

/// DDL for the four lock tables, one statement per entry.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS distributed_lock (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        lock_key VARCHAR(255) COLLATE utf8mb4_bin NOT NULL,
        holder VARCHAR(255) NOT NULL,
        expire_time DATETIME(3) NOT NULL,
        reentrant_count INT NOT NULL DEFAULT 1,
        UNIQUE KEY uk_lock_key (lock_key),
        KEY idx_expire_time (expire_time)
    ) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4",
    "CREATE TABLE IF NOT EXISTS lock_sequence (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        lock_key VARCHAR(255) COLLATE utf8mb4_bin NOT NULL,
        current_sequence BIGINT NOT NULL,
        UNIQUE KEY uk_lock_key (lock_key)
    ) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4",
    "CREATE TABLE IF NOT EXISTS lock_notify (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        lock_key VARCHAR(255) COLLATE utf8mb4_bin NOT NULL,
        sequence BIGINT NOT NULL,
        notify_time DATETIME(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        UNIQUE KEY uk_lock_key_sequence (lock_key, sequence),
        KEY idx_notify_time (notify_time)
    ) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4",
    "CREATE TABLE IF NOT EXISTS lock_wait_queue (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        lock_key VARCHAR(255) COLLATE utf8mb4_bin NOT NULL,
        sequence BIGINT NOT NULL,
        instance_id VARCHAR(64) NOT NULL,
        create_time DATETIME(3) NOT NULL,
        expire_time DATETIME(3) NOT NULL,
        UNIQUE KEY uk_lock_key_sequence (lock_key, sequence)
    ) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4",
];

/// Creates the lock tables if they do not exist.
pub async fn ensure_schema(pool: &MySqlPool) -> LockResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| LockError::store("failed to create lock schema", e))?;
    }
    info!(backend = "mysql", "lock schema ready");
    Ok(())
}
