//! The lock handle returned by [`DatabaseLockClient::get_lock`].
//!
//! [`DatabaseLockClient::get_lock`]: crate::provider::DatabaseLockClient

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rowlock_core::error::{LockError, LockResult};
use rowlock_core::holder::OwnerId;
use rowlock_core::record::{AcquireOutcome, ReleaseOutcome, expiry_after};
use rowlock_core::store::LockStore;
use rowlock_core::timeout::{Lease, Timeout, TimeoutValue};
use rowlock_core::traits::{DLock, LockHandle};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Span, debug, instrument, warn};

use crate::handle::LockGuard;
use crate::listener::{WaitOutcome, WaitSignal};
use crate::owner::OwnerEntry;
use crate::provider::LockContext;

/// Result of one pass through the acquisition transaction.
enum Attempt {
    Acquired,
    Held { until: Duration },
}

/// A reentrant lease lock on one key.
///
/// Handles are cheap and hold no state of their own: reentrancy is tracked
/// per owner in the client, and ownership lives in the store. Unless bound
/// with [`DatabaseLock::for_owner`], the owner is whoever calls: the current
/// tokio task, or the current thread outside of tokio.
pub struct DatabaseLock<S: LockStore> {
    name: String,
    key: Option<String>,
    owner: Option<OwnerId>,
    ctx: Arc<LockContext<S>>,
}

impl<S: LockStore> Clone for DatabaseLock<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            key: self.key.clone(),
            owner: self.owner.clone(),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<S: LockStore> DatabaseLock<S> {
    pub(crate) fn new(name: String, key: Option<String>, ctx: Arc<LockContext<S>>) -> Self {
        Self {
            name,
            key,
            owner: None,
            ctx,
        }
    }

    /// The same lock, acting for `owner` instead of the caller.
    pub fn for_owner(&self, owner: OwnerId) -> Self {
        Self {
            owner: Some(owner),
            ..self.clone()
        }
    }

    /// The key written to the store (the name, shortened if too long).
    pub fn key(&self) -> LockResult<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| LockError::InvalidName("lock key must not be empty".to_string()))
    }

    pub(crate) fn owner(&self) -> OwnerId {
        self.owner.clone().unwrap_or_else(OwnerId::current)
    }

    /// Acquires, runs `f`, then releases, also when `f` fails.
    pub async fn with_lock<F, Fut, T>(&self, wait: Timeout, lease: Lease, f: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(wait, lease).await?;
        let value = f().await;
        guard.release().await?;
        Ok(value)
    }

    /// Drops every hold `owner` has on any key of this client.
    ///
    /// Must run before a pooled worker identity is reused for unrelated work.
    pub fn clear(&self, owner: &OwnerId) -> usize {
        self.ctx.clear_owner(owner)
    }

    /// Reentrancy depth of the calling owner, 0 if it does not hold the lock.
    pub fn hold_count(&self) -> u32 {
        self.key()
            .ok()
            .and_then(|key| self.ctx.owners.get(key, &self.owner()))
            .map_or(0, |entry| entry.count)
    }

    pub(crate) async fn acquire_as(
        &self,
        key: &str,
        owner: &OwnerId,
        wait: Timeout,
        lease: Lease,
    ) -> LockResult<bool> {
        if let Lease::Fixed(d) = lease
            && d.is_zero()
        {
            return Err(LockError::Config("lease must be positive".to_string()));
        }

        let options = &self.ctx.options;
        let lease_duration = lease.effective(options.default_lease);
        let holder = self.ctx.instance_id.holder_for(owner);
        let deadline = TimeoutValue::from(wait).deadline(std::time::Instant::now());
        let remaining = || deadline.map(|d| d.saturating_duration_since(std::time::Instant::now()));

        let mut backoff = options.min_busy_wait;
        let mut signal: Option<WaitSignal<S>> = None;

        loop {
            match self.attempt(key, owner, &holder, lease, lease_duration).await {
                Ok(Attempt::Acquired) => {
                    if let Some(signal) = signal.take() {
                        signal.complete().await;
                    }
                    return Ok(true);
                }
                Ok(Attempt::Held { until }) => {
                    backoff = options.min_busy_wait;
                    let left = remaining();
                    if left.is_some_and(|d| d.is_zero()) {
                        if let Some(signal) = signal.take() {
                            signal.abandon().await;
                        }
                        return Ok(false);
                    }
                    if self.ctx.listener.is_closed() {
                        return Err(LockError::Interrupted);
                    }

                    // A woken waiter that lost the race queues up again.
                    if signal.as_ref().is_some_and(|s| s.is_notified())
                        && let Some(spent) = signal.take()
                    {
                        spent.abandon().await;
                    }
                    if signal.is_none() {
                        signal = self.enqueue(key, lease_duration).await?;
                    }

                    let mut slice = options
                        .recheck_interval
                        .min(until + options.notify_poll_interval)
                        .max(options.notify_poll_interval);
                    if let Some(left) = left {
                        slice = slice.min(left);
                    }

                    let Some(waiting) = signal.as_mut() else {
                        tokio::time::sleep(slice).await;
                        continue;
                    };
                    match waiting.wait(slice).await {
                        WaitOutcome::Notified => {
                            debug!(lock.key = %key, ticket = waiting.ticket(), "woken by release");
                        }
                        WaitOutcome::Elapsed => {
                            let expire_at =
                                expiry_after(Utc::now(), self.waiter_lifetime(lease_duration));
                            match waiting.touch(expire_at).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    if let Some(gone) = signal.take() {
                                        gone.abandon().await;
                                    }
                                }
                                Err(e) => {
                                    warn!(lock.key = %key, error = %e, "failed to refresh wait entry");
                                }
                            }
                        }
                        WaitOutcome::Lost => {
                            signal = None;
                            if self.ctx.listener.is_closed() {
                                return Err(LockError::Interrupted);
                            }
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    let left = remaining();
                    if left.is_some_and(|d| d.is_zero()) {
                        if let Some(signal) = signal.take() {
                            signal.abandon().await;
                        }
                        return Err(e);
                    }
                    warn!(lock.key = %key, error = %e, "acquisition outcome unknown, retrying");
                    let jitter = rand::thread_rng().gen_range(0.5..1.0);
                    let mut pause = backoff.mul_f64(jitter);
                    if let Some(left) = left {
                        pause = pause.min(left);
                    }
                    tokio::time::sleep(pause).await;
                    backoff = (backoff * 2).min(options.max_busy_wait);
                }
                Err(e) => {
                    if let Some(signal) = signal.take() {
                        signal.abandon().await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Registers a wait ticket; falls back to timed rechecks if that fails.
    async fn enqueue(&self, key: &str, lease: Duration) -> LockResult<Option<WaitSignal<S>>> {
        let expire_at = expiry_after(Utc::now(), self.waiter_lifetime(lease));
        match self.ctx.listener.enqueue(key, expire_at).await {
            Ok(signal) => Ok(Some(signal)),
            Err(LockError::Interrupted) => Err(LockError::Interrupted),
            Err(e) => {
                warn!(lock.key = %key, error = %e, "could not queue for wakeup, polling instead");
                Ok(None)
            }
        }
    }

    /// How long a wait entry must stay valid from now: the longest slice
    /// plus the configured multiple of the awaited lease.
    fn waiter_lifetime(&self, lease: Duration) -> Duration {
        self.ctx.options.recheck_interval + self.ctx.options.waiter_grace(lease)
    }

    async fn attempt(
        &self,
        key: &str,
        owner: &OwnerId,
        holder: &str,
        lease: Lease,
        lease_duration: Duration,
    ) -> LockResult<Attempt> {
        let owners = &self.ctx.owners;
        match self.ctx.store.try_acquire(key, holder, lease_duration).await? {
            AcquireOutcome::Acquired => self.first_hold(key, owner, holder, lease, lease_duration).await,
            AcquireOutcome::Reentered { count } => {
                let Some(entry) = owners.get(key, owner) else {
                    // Our earlier attempt committed but its reply never arrived.
                    warn!(lock.key = %key, count, "store counts a hold this owner never saw; reclaiming it");
                    if !self.reclaim(key, holder, lease_duration, count).await? {
                        return Ok(Attempt::Held { until: Duration::ZERO });
                    }
                    return self.first_hold(key, owner, holder, lease, lease_duration).await;
                };
                if entry.count + 1 != count {
                    warn!(
                        lock.key = %key,
                        local = entry.count + 1,
                        store = count,
                        "reentrancy count out of step; using the stored count"
                    );
                }
                owners.set_count(key, owner, count);
                debug!(lock.key = %key, count, "lock re-entered");
                Ok(Attempt::Acquired)
            }
            AcquireOutcome::Held { holder: current, expire_at } => {
                debug!(lock.key = %key, holder = %current, %expire_at, "lock held elsewhere");
                let until = (expire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                Ok(Attempt::Held { until })
            }
        }
    }

    /// Records a fresh hold for `owner` and starts its watchdog if needed.
    async fn first_hold(
        &self,
        key: &str,
        owner: &OwnerId,
        holder: &str,
        lease: Lease,
        lease_duration: Duration,
    ) -> LockResult<Attempt> {
        let owners = &self.ctx.owners;
        let entry = OwnerEntry {
            count: 1,
            lease: lease_duration,
            auto_extend: lease.is_auto_extend(),
        };
        if let Some(previous) = owners.insert(key, owner, entry) {
            warn!(
                lock.key = %key,
                previous_count = previous.count,
                "lease had expired while still held; acquired afresh"
            );
            if previous.auto_extend && !entry.auto_extend {
                self.ctx.watchdog.cancel_renewal_for(key, holder);
            }
        }
        if entry.auto_extend
            && let Err(e) = self.start_renewal(key, holder, lease_duration)
        {
            owners.remove(key, owner);
            if let Err(release_err) = self.ctx.store.release(key, holder, lease_duration).await {
                warn!(lock.key = %key, error = %release_err, "failed to undo acquisition");
            }
            return Err(e);
        }
        debug!(lock.key = %key, %holder, auto_extend = entry.auto_extend, "lock acquired");
        Ok(Attempt::Acquired)
    }

    /// Winds a stored count of `count` holds back down to one.
    ///
    /// Returns `false` if the row went away meanwhile.
    async fn reclaim(&self, key: &str, holder: &str, lease: Duration, mut count: u32) -> LockResult<bool> {
        while count > 1 {
            match self.ctx.store.release(key, holder, lease).await? {
                ReleaseOutcome::Decremented { remaining } => count = remaining,
                ReleaseOutcome::Released | ReleaseOutcome::NotHeld => {
                    debug!(lock.key = %key, "reclaimed hold vanished, retrying");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn start_renewal(&self, key: &str, holder: &str, lease: Duration) -> LockResult<watch::Receiver<bool>> {
        let period = self.ctx.options.renewal_interval(lease);
        let store = self.ctx.store.clone();
        let renew_key = key.to_string();
        let renew_holder = holder.to_string();
        self.ctx.watchdog.submit_renewal_task(key, holder, lease, period, period, move || {
            let store = store.clone();
            let key = renew_key.clone();
            let holder = renew_holder.clone();
            async move { store.extend(&key, &holder, lease).await }
        })
    }

    pub(crate) async fn release_as(&self, key: &str, owner: &OwnerId) -> LockResult<()> {
        let Some(entry) = self.ctx.owners.get(key, owner) else {
            return Err(LockError::IllegalState(format!(
                "{owner} does not hold lock {}",
                self.name
            )));
        };
        let holder = self.ctx.instance_id.holder_for(owner);

        match self.ctx.store.release(key, &holder, entry.lease).await? {
            ReleaseOutcome::Decremented { remaining } => {
                if remaining + 1 != entry.count {
                    warn!(
                        lock.key = %key,
                        local = entry.count.saturating_sub(1),
                        store = remaining,
                        "reentrancy count out of step; using the stored count"
                    );
                }
                self.ctx.owners.set_count(key, owner, remaining);
                debug!(lock.key = %key, remaining, "lock hold decremented");
                Ok(())
            }
            ReleaseOutcome::Released => {
                if entry.count != 1 {
                    warn!(lock.key = %key, local = entry.count, "store released a hold still counted locally");
                }
                self.ctx.owners.remove(key, owner);
                if entry.auto_extend {
                    self.ctx.watchdog.cancel_renewal_for(key, &holder);
                }
                debug!(lock.key = %key, "lock released");
                match self.ctx.listener.notify_next(key).await {
                    Ok(Some(ticket)) => debug!(lock.key = %key, ticket, "next waiter notified"),
                    Ok(None) => {}
                    Err(e) => warn!(lock.key = %key, error = %e, "failed to notify next waiter"),
                }
                Ok(())
            }
            ReleaseOutcome::NotHeld => {
                self.ctx.owners.remove(key, owner);
                if entry.auto_extend {
                    self.ctx.watchdog.cancel_renewal_for(key, &holder);
                }
                match self.ctx.watchdog.take_failure(key) {
                    Some(reason) => Err(LockError::RenewalFailed(reason)),
                    None => Err(LockError::LockLost(format!(
                        "lease on {} expired before unlock",
                        self.name
                    ))),
                }
            }
        }
    }

    fn lost_receiver(&self, key: &str, owner: &OwnerId) -> (Option<watch::Sender<bool>>, watch::Receiver<bool>) {
        let auto_extend = self
            .ctx
            .owners
            .get(key, owner)
            .is_some_and(|entry| entry.auto_extend);
        if auto_extend && let Some(receiver) = self.ctx.watchdog.subscribe(key) {
            return (None, receiver);
        }
        let (sender, receiver) = watch::channel(false);
        (Some(sender), receiver)
    }
}

impl<S: LockStore> DLock for DatabaseLock<S> {
    type Guard = LockGuard<S>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> LockResult<()> {
        self.lock_with_lease(Lease::Default).await
    }

    async fn lock_with_lease(&self, lease: Lease) -> LockResult<()> {
        if self.try_lock_for(None, lease).await? {
            Ok(())
        } else {
            Err(LockError::Timeout(Duration::MAX))
        }
    }

    async fn try_lock(&self) -> LockResult<bool> {
        self.try_lock_for(Some(Duration::ZERO), Lease::Default).await
    }

    #[instrument(
        skip(self),
        fields(
            lock.name = %self.name,
            backend = self.ctx.store.backend_name(),
            acquired = tracing::field::Empty,
            elapsed_ms = tracing::field::Empty,
        )
    )]
    async fn try_lock_for(&self, wait: Timeout, lease: Lease) -> LockResult<bool> {
        let key = self.key()?;
        let owner = self.owner();
        let start = Instant::now();
        let result = self.acquire_as(key, &owner, wait, lease).await;
        let span = Span::current();
        span.record("elapsed_ms", start.elapsed().as_millis() as u64);
        if let Ok(acquired) = &result {
            span.record("acquired", *acquired);
        }
        result
    }

    #[instrument(skip(self), fields(lock.name = %self.name, backend = self.ctx.store.backend_name()))]
    async fn unlock(&self) -> LockResult<()> {
        let key = self.key()?;
        let owner = self.owner();
        self.release_as(key, &owner).await
    }

    async fn acquire(&self, wait: Timeout, lease: Lease) -> LockResult<LockGuard<S>> {
        let key = self.key()?;
        let owner = self.owner();
        if !self.acquire_as(key, &owner, wait, lease).await? {
            return Err(LockError::Timeout(wait.unwrap_or(Duration::MAX)));
        }
        let (lost_sender, lost_receiver) = self.lost_receiver(key, &owner);
        Ok(LockGuard::new(
            self.for_owner(owner),
            key.to_string(),
            lost_sender,
            lost_receiver,
        ))
    }

    async fn is_locked(&self) -> LockResult<bool> {
        let key = self.key()?;
        let record = self.ctx.store.get(key).await?;
        Ok(record.is_some_and(|r| !r.is_expired_at(Utc::now())))
    }

    fn is_held_by_current_owner(&self) -> bool {
        self.key()
            .is_ok_and(|key| self.ctx.owners.contains(key, &self.owner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockStore;
    use crate::options::LockOptions;
    use crate::provider::DatabaseLockClient;
    use rowlock_core::traits::LockClient;

    fn client() -> DatabaseLockClient<MemoryLockStore> {
        DatabaseLockClient::builder()
            .store(MemoryLockStore::new())
            .options(LockOptions {
                recheck_interval: Duration::from_millis(500),
                ..LockOptions::default()
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn reentrant_holds_need_matching_unlocks() {
        let client = client();
        let lock = client.get_lock("order:1");
        let a = lock.for_owner(OwnerId::named("a"));
        let b = lock.for_owner(OwnerId::named("b"));

        assert!(a.try_lock().await.unwrap());
        assert!(a.try_lock().await.unwrap());
        assert_eq!(a.hold_count(), 2);
        assert!(!b.try_lock().await.unwrap());

        a.unlock().await.unwrap();
        assert!(a.is_held_by_current_owner());
        assert!(!b.try_lock().await.unwrap());

        a.unlock().await.unwrap();
        assert!(!a.is_held_by_current_owner());
        assert!(b.try_lock().await.unwrap());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_stored_holds_collapse_to_one() {
        let client = client();
        let lock = client.get_lock("order:7");
        let a = lock.for_owner(OwnerId::named("a"));
        let b = lock.for_owner(OwnerId::named("b"));
        client.store().insert_record(rowlock_core::record::LockRecord {
            lock_key: "order:7".to_string(),
            holder: client.instance_id().holder_for(&OwnerId::named("a")),
            expire_at: Utc::now() + chrono::Duration::minutes(1),
            reentrant_count: 3,
        });

        assert!(a.try_lock().await.unwrap());
        assert_eq!(a.hold_count(), 1);
        assert_eq!(client.store().record("order:7").unwrap().reentrant_count, 1);

        a.unlock().await.unwrap();
        assert!(client.store().record("order:7").is_none());
        assert!(b.try_lock().await.unwrap());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn unlock_without_hold_is_illegal() {
        let client = client();
        let lock = client.get_lock("order:2");
        assert!(matches!(lock.unlock().await, Err(LockError::IllegalState(_))));
    }

    #[tokio::test]
    async fn empty_name_fails_at_use() {
        let client = client();
        let lock = client.get_lock("");
        assert!(matches!(lock.try_lock().await, Err(LockError::InvalidName(_))));
        assert!(!lock.is_held_by_current_owner());
    }

    #[tokio::test]
    async fn zero_fixed_lease_is_rejected() {
        let client = client();
        let lock = client.get_lock("order:3");
        assert!(matches!(
            lock.try_lock_for(Some(Duration::ZERO), Lease::Fixed(Duration::ZERO)).await,
            Err(LockError::Config(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_operations_report_so() {
        let client = client();
        let lock = client.get_lock("order:4");
        assert!(matches!(
            lock.lock_interruptibly().await,
            Err(LockError::Unsupported("lock_interruptibly"))
        ));
        assert!(matches!(lock.new_condition(), Err(LockError::Unsupported(_))));
    }

    #[tokio::test]
    async fn expired_lease_is_reported_on_unlock() {
        let client = client();
        let lock = client.get_lock("order:5");
        let a = lock.for_owner(OwnerId::named("a"));
        let b = lock.for_owner(OwnerId::named("b"));

        assert!(
            a.try_lock_for(Some(Duration::ZERO), Lease::Fixed(Duration::from_millis(50)))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.try_lock().await.unwrap());

        assert!(matches!(a.unlock().await, Err(LockError::LockLost(_))));
        assert!(!a.is_held_by_current_owner());
        assert!(b.is_held_by_current_owner());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_is_woken_by_release() {
        let client = client();
        let lock = client.get_lock("order:6");
        let a = lock.for_owner(OwnerId::named("a"));
        let b = lock.for_owner(OwnerId::named("b"));
        assert!(a.try_lock().await.unwrap());

        let waiter = tokio::spawn(async move {
            let start = Instant::now();
            let acquired = b
                .try_lock_for(Some(Duration::from_secs(5)), Lease::Default)
                .await
                .unwrap();
            (acquired, start.elapsed(), b)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        a.unlock().await.unwrap();

        let (acquired, elapsed, b) = waiter.await.unwrap();
        assert!(acquired);
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn auto_extend_registers_and_cancels_renewal() {
        let client = client();
        let lock = client.get_lock("order:7");
        lock.lock_with_lease(Lease::AutoExtend).await.unwrap();
        assert!(client.watchdog().is_renewing("order:7"));

        lock.unlock().await.unwrap();
        assert!(!client.watchdog().is_renewing("order:7"));
        assert!(!lock.is_locked().await.unwrap());
    }
}
