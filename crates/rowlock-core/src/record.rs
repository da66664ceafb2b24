//! Rows of the four lock tables.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `at + d`, saturating at a far-future instant for absurdly long durations.
pub fn expiry_after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One row per contended key in `distributed_lock`.
///
/// If the row exists and `expire_at` is in the future the lock is held by
/// exactly `holder`; otherwise the key is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(rename = "lockKey")]
    pub lock_key: String,

    pub holder: String,

    #[serde(rename = "expireAt")]
    pub expire_at: DateTime<Utc>,

    #[serde(rename = "reentrantCount")]
    pub reentrant_count: u32,
}

impl LockRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at < now
    }
}

/// "The lock became free; `sequence` may proceed." Rows of `lock_notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "lockKey")]
    pub lock_key: String,

    pub sequence: i64,

    #[serde(rename = "notifyTime")]
    pub notified_at: DateTime<Utc>,
}

/// One outstanding wait registered by a process. Rows of `lock_wait_queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEntry {
    #[serde(rename = "lockKey")]
    pub lock_key: String,

    pub sequence: i64,

    #[serde(rename = "instanceId")]
    pub instance_id: String,

    #[serde(rename = "createTime")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "expireTime")]
    pub expire_at: DateTime<Utc>,
}

/// Result of one acquisition transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A new row was inserted, or an expired row was taken over.
    Acquired,
    /// The caller already held the row; its count is now `count`.
    Reentered { count: u32 },
    /// Someone else owns the row until `expire_at`.
    Held {
        holder: String,
        expire_at: DateTime<Utc>,
    },
}

/// Result of one release transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Count decremented; the caller still holds the lock.
    Decremented { remaining: u32 },
    /// The row was deleted; the key is free.
    Released,
    /// No row for this key carries the caller as holder.
    NotHeld,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_saturates() {
        let now = Utc::now();
        assert_eq!(
            expiry_after(now, Duration::from_millis(1500)),
            now + chrono::Duration::milliseconds(1500)
        );
        assert_eq!(expiry_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn record_expiry_is_strict() {
        let now = Utc::now();
        let record = LockRecord {
            lock_key: "lock:shop:1".into(),
            holder: "a:task-1".into(),
            expire_at: now,
            reentrant_count: 1,
        };
        assert!(!record.is_expired_at(now));
        assert!(record.is_expired_at(now + chrono::Duration::milliseconds(1)));
    }
}
