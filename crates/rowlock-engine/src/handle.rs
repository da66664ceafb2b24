//! Scoped lock holds.

use rowlock_core::error::LockResult;
use rowlock_core::store::LockStore;
use rowlock_core::traits::LockHandle;
use tokio::sync::watch;
use tracing::{instrument, warn};

use crate::lock::DatabaseLock;

/// Handle to one level of a held lock, bound to the owner that acquired it.
///
/// Dropping this handle releases the hold in the background. For proper error
/// handling in async contexts, call `release()` explicitly.
pub struct LockGuard<S: LockStore> {
    lock: DatabaseLock<S>,
    key: String,
    /// Keeps the receiver open for holds that are never renewed.
    _lost_sender: Option<watch::Sender<bool>>,
    lost_receiver: watch::Receiver<bool>,
    released: bool,
}

impl<S: LockStore> LockGuard<S> {
    pub(crate) fn new(
        lock: DatabaseLock<S>,
        key: String,
        lost_sender: Option<watch::Sender<bool>>,
        lost_receiver: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lock,
            key,
            _lost_sender: lost_sender,
            lost_receiver,
            released: false,
        }
    }

    pub fn lock(&self) -> &DatabaseLock<S> {
        &self.lock
    }
}

impl<S: LockStore> LockHandle for LockGuard<S> {
    fn lost_token(&self) -> &watch::Receiver<bool> {
        &self.lost_receiver
    }

    #[instrument(skip(self), fields(lock.key = %self.key))]
    async fn release(mut self) -> LockResult<()> {
        self.released = true;
        let owner = self.lock.owner();
        self.lock.release_as(&self.key, &owner).await
    }
}

impl<S: LockStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock.key = %self.key, "lock guard dropped outside a runtime; hold left to expire");
            return;
        };
        let lock = self.lock.clone();
        let key = self.key.clone();
        let owner = self.lock.owner();
        runtime.spawn(async move {
            if let Err(e) = lock.release_as(&key, &owner).await {
                warn!(lock.key = %key, error = %e, "background release of dropped guard failed");
            }
        });
    }
}
