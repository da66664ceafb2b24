//! MySQL backend for row-based distributed locks.

pub mod connection;
pub mod provider;
pub mod schema;
pub mod store;

pub use connection::MySqlConnection;
pub use provider::{MySqlLockClient, MySqlLockClientBuilder};
pub use schema::ensure_schema;
pub use store::MySqlLockStore;
