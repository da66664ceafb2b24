//! Error types for distributed lock operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock acquisition gave up after exhausting its wait budget.
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),

    /// The wait was aborted because the owning client shut down.
    #[error("lock wait was interrupted")]
    Interrupted,

    /// The watchdog could not extend a lease this process believed it owned.
    #[error("lease renewal failed: {0}")]
    RenewalFailed(String),

    /// Unlock without holding the lock, or reentrancy bookkeeping out of step.
    #[error("illegal lock state: {0}")]
    IllegalState(String),

    /// The lock record was expired and claimed by someone else, or deleted.
    #[error("lock was lost: {0}")]
    LockLost(String),

    /// The operation is deliberately not provided by this lock.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Invalid lock name.
    #[error("invalid lock name: {0}")]
    InvalidName(String),

    /// Could not obtain a connection to the backing store.
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A statement against the backing store failed.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// Wraps a backend error with a short description of what was being done.
    pub fn store(context: &str, err: impl std::fmt::Display) -> Self {
        LockError::Store(Box::new(std::io::Error::other(format!("{context}: {err}"))))
    }

    /// Wraps a connection-level error with context.
    pub fn connection(context: &str, err: impl std::fmt::Display) -> Self {
        LockError::Connection(Box::new(std::io::Error::other(format!("{context}: {err}"))))
    }

    /// Returns true for failures of the persistence layer that a retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(self, LockError::Connection(_) | LockError::Store(_))
    }
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;
