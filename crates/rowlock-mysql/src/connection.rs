//! MySQL connection management for lock stores.

use std::fmt;

use rowlock_core::error::{LockError, LockResult};
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;

/// Represents different ways to connect to MySQL.
#[derive(Clone)]
pub enum MySqlConnection {
    /// Connect using a connection string.
    ConnectionString(String),
    /// Use an existing connection pool.
    Pool(MySqlPool),
}

impl MySqlConnection {
    /// Get or create a connection pool.
    ///
    /// For ConnectionString variant, creates a new pool.
    /// For Pool variant, clones the existing pool.
    pub async fn get_pool(&self, max_connections: u32) -> LockResult<MySqlPool> {
        match self {
            MySqlConnection::ConnectionString(url) => MySqlPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
                .map_err(|e| LockError::connection("failed to create mysql pool", e)),
            MySqlConnection::Pool(pool) => Ok(pool.clone()),
        }
    }
}

impl fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MySqlConnection::ConnectionString(_) => {
                write!(f, "MySqlConnection::ConnectionString([REDACTED])")
            }
            MySqlConnection::Pool(_) => write!(f, "MySqlConnection::Pool([POOL])"),
        }
    }
}
