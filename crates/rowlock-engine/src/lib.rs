//! Store-agnostic machinery for relational-store distributed locks.
//!
//! [`DatabaseLockClient`] hands out [`DatabaseLock`]s over any
//! [`LockStore`](rowlock_core::LockStore). Each lock is a reentrant lease on
//! one row; waiters queue with tickets and are woken by the
//! [`NotificationListener`]; locks held in auto-extend mode are kept alive by
//! the [`Watchdog`]; the [`Reaper`] removes long-expired rows.
//!
//! # Wakeup order
//!
//! Waiters take tickets in the order they first find the lock held. A
//! release names the lowest ticket whose wait entry is still live, and only
//! that waiter is woken. Because a woken waiter still has to win the
//! acquisition transaction, a caller arriving at that moment may overtake
//! it; the loser queues again with a new ticket. Waiters also re-check on
//! their own once the holder's lease should have run out.

pub mod handle;
pub mod listener;
pub mod lock;
pub mod memory;
pub(crate) mod owner;
pub mod options;
pub mod provider;
pub mod reaper;
pub mod settings;
pub mod watchdog;

pub use handle::LockGuard;
pub use listener::{NotificationListener, WaitOutcome, WaitSignal};
pub use lock::DatabaseLock;
pub use memory::MemoryLockStore;
pub use options::{LockOptions, ReapSchedule, ReaperOptions};
pub use provider::{DatabaseLockClient, DatabaseLockClientBuilder};
pub use reaper::{ReapReport, Reaper, ReaperStats};
pub use settings::LockSettings;
pub use watchdog::Watchdog;
