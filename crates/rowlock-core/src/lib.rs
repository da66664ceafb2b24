//! Core traits and types for distributed locks kept in relational tables.

pub mod error;
pub mod holder;
pub mod name;
pub mod prelude;
pub mod record;
pub mod store;
pub mod timeout;
pub mod traits;

pub use error::{LockError, LockResult};
pub use prelude::*;
