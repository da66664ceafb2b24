//! Connection pool management for PostgreSQL lock stores.

use std::fmt;

use rowlock_core::error::{LockError, LockResult};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// PostgreSQL connection source.
#[derive(Clone)]
pub enum PostgresConnection {
    /// Connection string - library manages pooling.
    ConnectionString(String),
    /// External connection pool.
    Pool(PgPool),
}

impl PostgresConnection {
    /// Gets or creates a connection pool.
    pub async fn get_pool(&self, max_connections: u32) -> LockResult<PgPool> {
        match self {
            Self::ConnectionString(url) => PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
                .map_err(|e| LockError::connection("failed to create postgres pool", e)),
            Self::Pool(pool) => Ok(pool.clone()),
        }
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionString(_) => write!(f, "PostgresConnection::ConnectionString([REDACTED])"),
            Self::Pool(_) => write!(f, "PostgresConnection::Pool([POOL])"),
        }
    }
}
