//! Lock client and builder.

use std::sync::Arc;

use rowlock_core::error::{LockError, LockResult};
use rowlock_core::holder::{InstanceId, OwnerId};
use rowlock_core::name::encode_lock_key;
use rowlock_core::store::LockStore;
use rowlock_core::traits::LockClient;
use tracing::{info, warn};

use crate::listener::NotificationListener;
use crate::lock::DatabaseLock;
use crate::options::{LockOptions, ReaperOptions};
use crate::owner::OwnerTable;
use crate::reaper::Reaper;
use crate::watchdog::Watchdog;

/// State shared by every lock handed out by one client.
pub(crate) struct LockContext<S: LockStore> {
    pub store: S,
    pub instance_id: InstanceId,
    pub options: LockOptions,
    pub owners: OwnerTable,
    pub watchdog: Watchdog,
    pub listener: NotificationListener<S>,
}

impl<S: LockStore> LockContext<S> {
    pub fn clear_owner(&self, owner: &OwnerId) -> usize {
        let leaked = self.owners.take_owner(owner);
        let holder = self.instance_id.holder_for(owner);
        for (key, entry) in &leaked {
            warn!(
                lock.key = %key,
                %owner,
                count = entry.count,
                "owner cleared while still holding lock; the record is left to expire"
            );
            if entry.auto_extend {
                self.watchdog.cancel_renewal_for(key, &holder);
            }
        }
        leaked.len()
    }
}

/// Builder for database lock clients.
pub struct DatabaseLockClientBuilder<S: LockStore> {
    store: Option<S>,
    options: LockOptions,
    instance_id: Option<InstanceId>,
}

impl<S: LockStore> DatabaseLockClientBuilder<S> {
    pub fn new() -> Self {
        Self {
            store: None,
            options: LockOptions::default(),
            instance_id: None,
        }
    }

    pub fn store(mut self, store: S) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    /// Fixes the process identity; a random one is generated otherwise.
    pub fn instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn build(self) -> LockResult<DatabaseLockClient<S>> {
        let store = self
            .store
            .ok_or_else(|| LockError::Config("no lock store specified".to_string()))?;
        self.options.validate()?;
        let instance_id = self.instance_id.unwrap_or_else(InstanceId::generate);

        let listener = NotificationListener::new(
            store.clone(),
            instance_id.clone(),
            self.options.notify_poll_interval,
            self.options.waiter_sweep_interval,
        );
        let watchdog = Watchdog::new(self.options.watchdog_pool_size);
        info!(
            backend = store.backend_name(),
            instance = %instance_id,
            default_lease = ?self.options.default_lease,
            "lock client ready"
        );

        Ok(DatabaseLockClient {
            ctx: Arc::new(LockContext {
                store,
                instance_id,
                options: self.options,
                owners: OwnerTable::default(),
                watchdog,
                listener,
            }),
        })
    }
}

impl<S: LockStore> Default for DatabaseLockClientBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out [`DatabaseLock`]s over one store.
///
/// Create one per process and share it; locks are cheap views and are not
/// cached.
pub struct DatabaseLockClient<S: LockStore> {
    ctx: Arc<LockContext<S>>,
}

impl<S: LockStore> Clone for DatabaseLockClient<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<S: LockStore> DatabaseLockClient<S> {
    pub fn builder() -> DatabaseLockClientBuilder<S> {
        DatabaseLockClientBuilder::new()
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.ctx.instance_id
    }

    pub fn options(&self) -> &LockOptions {
        &self.ctx.options
    }

    pub fn store(&self) -> &S {
        &self.ctx.store
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.ctx.watchdog
    }

    pub fn listener(&self) -> &NotificationListener<S> {
        &self.ctx.listener
    }

    /// A reaper over this client's store.
    pub fn reaper(&self, options: ReaperOptions) -> LockResult<Reaper<S>> {
        Reaper::new(self.ctx.store.clone(), options)
    }

    /// Forgets every hold of `owner` and stops its renewals; returns how many
    /// holds were dropped.
    ///
    /// Call this when a worker identity goes back to a pool.
    pub fn clear_owner(&self, owner: &OwnerId) -> usize {
        self.ctx.clear_owner(owner)
    }

    /// Stops the watchdog and the listener. Pending waits fail with
    /// `Interrupted`; held records are left to expire.
    pub async fn shutdown(&self) {
        self.ctx.watchdog.shutdown().await;
        self.ctx.listener.shutdown().await;
        info!(instance = %self.ctx.instance_id, "lock client shut down");
    }
}

impl<S: LockStore> LockClient for DatabaseLockClient<S> {
    type Lock = DatabaseLock<S>;

    fn get_lock(&self, name: &str) -> Self::Lock {
        let key = encode_lock_key(name, self.ctx.store.max_key_length()).ok();
        DatabaseLock::new(name.to_string(), key, Arc::clone(&self.ctx))
    }
}
