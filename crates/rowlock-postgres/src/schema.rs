//! Table definitions for the PostgreSQL lock store.

use rowlock_core::error::{LockError, LockResult};
use sqlx::PgPool;
use tracing::info;

/// DDL for the four lock tables, one statement per entry.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS distributed_lock (
        id BIGSERIAL PRIMARY KEY,
        lock_key VARCHAR(255) NOT NULL UNIQUE,
        holder VARCHAR(255) NOT NULL,
        expire_time TIMESTAMPTZ NOT NULL,
        reentrant_count INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE INDEX IF NOT EXISTS idx_distributed_lock_expire_time ON distributed_lock (expire_time)",
    "CREATE TABLE IF NOT EXISTS lock_sequence (
        id BIGSERIAL PRIMARY KEY,
        lock_key VARCHAR(255) NOT NULL UNIQUE,
        current_sequence BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS lock_notify (
        id BIGSERIAL PRIMARY KEY,
        lock_key VARCHAR(255) NOT NULL,
        sequence BIGINT NOT NULL,
        notify_time TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (lock_key, sequence)
    )",
    "CREATE INDEX IF NOT EXISTS idx_lock_notify_time ON lock_notify (notify_time)",
    "CREATE TABLE IF NOT EXISTS lock_wait_queue (
        id BIGSERIAL PRIMARY KEY,
        lock_key VARCHAR(255) NOT NULL,
        sequence BIGINT NOT NULL,
        instance_id VARCHAR(64) NOT NULL,
        create_time TIMESTAMPTZ NOT NULL,
        expire_time TIMESTAMPTZ NOT NULL,
        UNIQUE (lock_key, sequence)
    )",
];

/// Creates the lock tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> LockResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| LockError::store("failed to create lock schema", e))?;
    }
    info!(backend = "postgres", "lock schema ready");
    Ok(())
}
