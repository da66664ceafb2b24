//! PostgreSQL backend for row-based distributed locks.
//!
//! Lock state lives in four ordinary tables (`distributed_lock`,
//! `lock_sequence`, `lock_notify` and `lock_wait_queue`); see [`schema`].

pub mod connection;
pub mod provider;
pub mod schema;
pub mod store;

pub use connection::PostgresConnection;
pub use provider::{PostgresLockClient, PostgresLockClientBuilder};
pub use schema::ensure_schema;
pub use store::PostgresLockStore;
