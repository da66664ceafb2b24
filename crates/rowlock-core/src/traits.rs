//! Core traits for distributed locks.

use std::convert::Infallible;
use std::future::Future;

use crate::error::{LockError, LockResult};
use crate::timeout::{Lease, Timeout};

// ============================================================================
// Lock Handle Trait
// ============================================================================

/// Guard for a held distributed lock.
///
/// Dropping the guard releases the lock in the background. For proper error
/// handling in async contexts, call `release()` explicitly.
///
/// # Example
///
/// ```rust,ignore
/// let guard = lock.acquire(Some(Duration::from_secs(5)), Lease::AutoExtend).await?;
/// // Critical section - we hold the lock
/// do_work().await;
/// // Explicit release with error handling
/// guard.release().await?;
/// ```
pub trait LockHandle: Send + Sync + Sized {
    /// Returns a receiver that signals when the lock is lost.
    ///
    /// The receiver yields `true` once the watchdog fails to renew the lease
    /// (the record was reaped or claimed by another holder). Locks held with a
    /// fixed lease are never renewed, so their receiver never changes from
    /// `false`; they simply expire.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// tokio::select! {
    ///     _ = guard.lost_token().changed() => {
    ///         eprintln!("Lock was lost!");
    ///     }
    ///     _ = do_work() => {
    ///         // Work completed while still holding lock
    ///     }
    /// }
    /// ```
    fn lost_token(&self) -> &tokio::sync::watch::Receiver<bool>;

    /// Explicitly releases the lock (one level of reentrancy).
    fn release(self) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// DLock
// ============================================================================

/// A reentrant, lease-based distributed mutual exclusion lock.
///
/// Ownership is tracked per *owner*: the current tokio task, the current OS
/// thread outside of tokio, or an explicitly named owner. The same owner may
/// re-acquire a lock it holds and must unlock as many times as it locked.
///
/// # Lease safety
///
/// A lease that is not renewed in time (process paused, watchdog stopped,
/// store unreachable) is claimed by the next acquirer once it expires. An
/// owner that resumes afterwards no longer provably holds the resource and
/// must treat any further protected work as unsafe.
///
/// # Example
///
/// ```rust,ignore
/// use rowlock_core::{DLock, Lease};
///
/// async fn place_order(lock: &impl DLock) -> LockResult<()> {
///     if !lock.try_lock_for(Some(Duration::from_secs(5)), Lease::AutoExtend).await? {
///         return Ok(()); // somebody else is working on it
///     }
///     let result = create_order().await;
///     lock.unlock().await?;
///     result
/// }
/// ```
pub trait DLock: Send + Sync {
    /// The guard type returned by [`DLock::acquire`].
    type Guard: LockHandle + Send;

    /// Returns the name identifying this lock.
    fn name(&self) -> &str;

    /// Blocks until acquired, using the default lease.
    fn lock(&self) -> impl Future<Output = LockResult<()>> + Send;

    /// Blocks until acquired with the given lease. [`Lease::AutoExtend`] keeps
    /// the lock alive until `unlock`.
    fn lock_with_lease(&self, lease: Lease) -> impl Future<Output = LockResult<()>> + Send;

    /// A single attempt with the default lease; never waits.
    fn try_lock(&self) -> impl Future<Output = LockResult<bool>> + Send;

    /// Attempts acquisition, waiting up to `wait` (`None` = forever) to be
    /// woken by a release.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Lock acquired (or re-entered)
    /// * `Ok(false)` - Wait budget exhausted while another holder owned it
    /// * `Err(LockError::Interrupted)` - The client shut down during the wait
    /// * `Err(LockError::Store)` - The store kept failing until the budget ran out
    fn try_lock_for(
        &self,
        wait: Timeout,
        lease: Lease,
    ) -> impl Future<Output = LockResult<bool>> + Send;

    /// Releases one level of reentrancy; the last unlock frees the key and
    /// wakes the next waiter.
    ///
    /// Fails with `IllegalState` if the calling owner does not hold the lock.
    fn unlock(&self) -> impl Future<Output = LockResult<()>> + Send;

    /// Acquires and returns a guard bound to the calling owner.
    ///
    /// Fails with `LockError::Timeout` when `wait` elapses first.
    fn acquire(
        &self,
        wait: Timeout,
        lease: Lease,
    ) -> impl Future<Output = LockResult<Self::Guard>> + Send;

    /// Whether any holder currently owns an unexpired record for this key.
    fn is_locked(&self) -> impl Future<Output = LockResult<bool>> + Send;

    /// Whether the calling owner holds this lock.
    fn is_held_by_current_owner(&self) -> bool;

    /// Not supported: waits are cancelled by dropping the future instead.
    fn lock_interruptibly(&self) -> impl Future<Output = LockResult<()>> + Send {
        async { Err(LockError::Unsupported("lock_interruptibly")) }
    }

    /// Not supported: this is a mutual-exclusion primitive only.
    fn new_condition(&self) -> LockResult<Infallible> {
        Err(LockError::Unsupported("new_condition"))
    }
}

// ============================================================================
// Client Traits
// ============================================================================

/// Factory for locks by name.
///
/// A client is shared process-wide; the locks it returns are cheap, uncached
/// views onto state that lives in the store.
///
/// # Example
///
/// ```rust,ignore
/// // Configure once at startup
/// let client = PostgresLockClient::builder()
///     .connection_string(url)
///     .build()
///     .await?;
///
/// // Create locks by name anywhere in the application
/// let lock = client.get_lock("lock:order:42");
/// lock.lock().await?;
/// ```
pub trait LockClient: Send + Sync {
    /// The lock type created by this client.
    type Lock: DLock;

    /// Returns a lock bound to `name`.
    fn get_lock(&self, name: &str) -> Self::Lock;
}

// ============================================================================
// Convenience Extensions
// ============================================================================

/// Extension trait providing convenience methods for lock clients.
pub trait LockClientExt: LockClient {
    /// Acquires a lock by name, returning its guard.
    ///
    /// Convenience method combining `get_lock` and `acquire`.
    fn acquire_lock(
        &self,
        name: &str,
        wait: Timeout,
        lease: Lease,
    ) -> impl Future<Output = LockResult<<Self::Lock as DLock>::Guard>> + Send
    where
        Self: Sync,
    {
        async move {
            let lock = self.get_lock(name);
            lock.acquire(wait, lease).await
        }
    }

    /// Tries once to lock by name.
    ///
    /// Convenience method combining `get_lock` and `try_lock`.
    fn try_lock_name(&self, name: &str) -> impl Future<Output = LockResult<bool>> + Send
    where
        Self: Sync,
    {
        async move {
            let lock = self.get_lock(name);
            lock.try_lock().await
        }
    }
}

// Blanket implementation for all LockClients
impl<T: LockClient> LockClientExt for T {}
