//! Ticketed wakeups for waiting acquirers.
//!
//! A waiter takes a ticket from the sequence counter, registers a wait entry
//! and subscribes here. For every key with local waiters one poller task reads
//! the notification log every `notify_poll_interval` and completes the one-shot
//! signal whose ticket was announced. A release announces the lowest live
//! ticket and removes its entry, so each ticket is handed the lock at most
//! once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rowlock_core::error::{LockError, LockResult};
use rowlock_core::holder::InstanceId;
use rowlock_core::record::WaitEntry;
use rowlock_core::store::LockStore;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

/// How a bounded wait on a ticket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A release named this ticket.
    Notified,
    /// The slice elapsed without a notification.
    Elapsed,
    /// The signal was dropped by the sweeper or by shutdown.
    Lost,
}

struct KeyWaiters {
    signals: HashMap<i64, oneshot::Sender<()>>,
    poller: JoinHandle<()>,
}

struct ListenerShared<S: LockStore> {
    store: S,
    instance_id: InstanceId,
    poll_interval: Duration,
    sweep_interval: Duration,
    keys: Mutex<HashMap<String, KeyWaiters>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Per-process notification listener.
pub struct NotificationListener<S: LockStore> {
    shared: Arc<ListenerShared<S>>,
}

impl<S: LockStore> Clone for NotificationListener<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: LockStore> NotificationListener<S> {
    pub fn new(
        store: S,
        instance_id: InstanceId,
        poll_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                store,
                instance_id,
                poll_interval,
                sweep_interval,
                keys: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Takes a ticket for `key`, registers a wait entry expiring at
    /// `expire_at` and returns the signal that completes when it is named.
    pub async fn enqueue(&self, key: &str, expire_at: DateTime<Utc>) -> LockResult<WaitSignal<S>> {
        if self.is_closed() {
            return Err(LockError::Interrupted);
        }

        let store = &self.shared.store;
        let ticket = store.next_ticket(key).await?;
        store
            .register(&WaitEntry {
                lock_key: key.to_string(),
                sequence: ticket,
                instance_id: self.shared.instance_id.to_string(),
                created_at: Utc::now(),
                expire_at,
            })
            .await?;

        let receiver = match self.subscribe(key, ticket) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = store.remove(key, ticket).await;
                return Err(e);
            }
        };
        let signal = WaitSignal {
            shared: Arc::clone(&self.shared),
            key: key.to_string(),
            ticket,
            receiver,
            notified: false,
            finished: false,
        };

        // A release may have named the ticket before the poller knew about it.
        if store.contains(key, ticket).await? {
            self.shared.signal(key, ticket);
        }
        debug!(lock.key = %key, ticket, "waiting for notification");
        Ok(signal)
    }

    fn subscribe(&self, key: &str, ticket: i64) -> LockResult<oneshot::Receiver<()>> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut keys = self.shared.keys.lock();
            if self.is_closed() {
                return Err(LockError::Interrupted);
            }
            match keys.entry(key.to_string()) {
                Entry::Occupied(mut waiters) => {
                    waiters.get_mut().signals.insert(ticket, sender);
                }
                Entry::Vacant(slot) => {
                    let poller = tokio::spawn(poll_key(Arc::downgrade(&self.shared), key.to_string()));
                    slot.insert(KeyWaiters {
                        signals: HashMap::from([(ticket, sender)]),
                        poller,
                    });
                }
            }
        }
        self.ensure_sweeper();
        Ok(receiver)
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.shared.sweeper.lock();
        if sweeper.as_ref().is_none_or(|h| h.is_finished()) {
            *sweeper = Some(tokio::spawn(sweep(
                Arc::downgrade(&self.shared),
                self.shared.sweep_interval,
            )));
        }
    }

    /// Hands the lock to the lowest live ticket of `key`.
    ///
    /// Expired entries are purged first; the chosen entry is removed after
    /// its notification is written.
    pub async fn notify_next(&self, key: &str) -> LockResult<Option<i64>> {
        let store = &self.shared.store;
        let now = Utc::now();
        store.purge_expired(key, now).await?;
        let Some(ticket) = store.min_ticket(key, now).await? else {
            return Ok(None);
        };
        store.publish(key, ticket).await?;
        store.remove(key, ticket).await?;
        debug!(lock.key = %key, ticket, "notified next waiter");
        Ok(Some(ticket))
    }

    /// Number of keys with a running poller.
    pub fn active_keys(&self) -> usize {
        self.shared.keys.lock().len()
    }

    /// Stops all pollers; pending waits observe [`WaitOutcome::Lost`] and
    /// their callers fail with `Interrupted`.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let waiters: Vec<KeyWaiters> = self.shared.keys.lock().drain().map(|(_, w)| w).collect();
        for waiters in waiters {
            waiters.poller.abort();
            let _ = waiters.poller.await;
        }
        let sweeper = self.shared.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
            let _ = sweeper.await;
        }
        debug!("notification listener shut down");
    }
}

impl<S: LockStore> ListenerShared<S> {
    fn signal(&self, key: &str, ticket: i64) {
        if let Some(waiters) = self.keys.lock().get_mut(key)
            && let Some(sender) = waiters.signals.remove(&ticket)
        {
            let _ = sender.send(());
        }
    }

    fn drop_signal(&self, key: &str, ticket: i64) {
        if let Some(waiters) = self.keys.lock().get_mut(key) {
            waiters.signals.remove(&ticket);
        }
    }
}

/// Delivers notifications for `key` to local waiters.
///
/// A ticket may register after a higher one was already announced, so each
/// round reads from the lowest ticket still waiting rather than from the
/// last event seen.
async fn poll_key<S: LockStore>(shared: Weak<ListenerShared<S>>, key: String) {
    let poll_interval = match shared.upgrade() {
        Some(shared) => shared.poll_interval,
        None => return,
    };
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let lowest = {
            let mut keys = shared.keys.lock();
            let Some(waiters) = keys.get(&key) else {
                return;
            };
            match waiters.signals.keys().min() {
                Some(&ticket) => ticket,
                None => {
                    keys.remove(&key);
                    debug!(lock.key = %key, "no local waiters left, poller stopped");
                    return;
                }
            }
        };

        match shared.store.events_after(&key, lowest - 1).await {
            Ok(events) => {
                for event in events {
                    shared.signal(&key, event.sequence);
                }
            }
            Err(e) => warn!(lock.key = %key, error = %e, "failed to read notifications"),
        }
    }
}

async fn sweep<S: LockStore>(shared: Weak<ListenerShared<S>>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        sweep_once(&shared).await;
    }
}

/// Drops local signals whose store entry expired or vanished. A store error
/// on one key is logged and the rest are still swept.
async fn sweep_once<S: LockStore>(shared: &ListenerShared<S>) {
    let local: Vec<(String, Vec<i64>)> = shared
        .keys
        .lock()
        .iter()
        .map(|(key, waiters)| (key.clone(), waiters.signals.keys().copied().collect()))
        .collect();

    let now = Utc::now();
    let instance = shared.instance_id.to_string();
    for (key, tickets) in local {
        if let Err(e) = sweep_key(shared, &key, &tickets, now, &instance).await {
            warn!(lock.key = %key, error = %e, "wait entry sweep failed");
        }
    }
}

async fn sweep_key<S: LockStore>(
    shared: &ListenerShared<S>,
    key: &str,
    tickets: &[i64],
    now: DateTime<Utc>,
    instance: &str,
) -> LockResult<()> {
    let purged = shared.store.purge_expired(key, now).await?;
    if purged > 0 {
        debug!(lock.key = %key, purged, "purged expired wait entries");
    }
    for &ticket in tickets {
        if !shared.store.exists(key, ticket, instance).await?
            && !shared.store.contains(key, ticket).await?
        {
            debug!(lock.key = %key, ticket, "dropping orphaned wait signal");
            shared.drop_signal(key, ticket);
        }
    }
    Ok(())
}

/// One registered wait. Dropping it without [`WaitSignal::complete`] or
/// [`WaitSignal::abandon`] releases it in the background.
pub struct WaitSignal<S: LockStore> {
    shared: Arc<ListenerShared<S>>,
    key: String,
    ticket: i64,
    receiver: oneshot::Receiver<()>,
    notified: bool,
    finished: bool,
}

impl<S: LockStore> WaitSignal<S> {
    pub fn ticket(&self) -> i64 {
        self.ticket
    }

    /// Whether this ticket has already been named by a release.
    pub fn is_notified(&self) -> bool {
        self.notified
    }

    /// Waits up to `slice` for this ticket to be named.
    pub async fn wait(&mut self, slice: Duration) -> WaitOutcome {
        if self.notified {
            return WaitOutcome::Notified;
        }
        match tokio::time::timeout(slice, &mut self.receiver).await {
            Ok(Ok(())) => {
                self.notified = true;
                WaitOutcome::Notified
            }
            Ok(Err(_)) => WaitOutcome::Lost,
            Err(_) => WaitOutcome::Elapsed,
        }
    }

    /// Pushes the wait entry's expiry to `expire_at`; `false` if it is gone.
    pub async fn touch(&self, expire_at: DateTime<Utc>) -> LockResult<bool> {
        self.shared
            .store
            .touch(&self.key, self.ticket, expire_at)
            .await
    }

    /// The lock was acquired while holding this ticket: drops the wait entry
    /// and prunes notifications up to it.
    pub async fn complete(mut self) {
        self.finished = true;
        self.shared.drop_signal(&self.key, self.ticket);
        let store = &self.shared.store;
        if let Err(e) = store.remove(&self.key, self.ticket).await {
            warn!(lock.key = %self.key, ticket = self.ticket, error = %e, "failed to remove wait entry");
        }
        if let Err(e) = store.prune(&self.key, self.ticket).await {
            warn!(lock.key = %self.key, ticket = self.ticket, error = %e, "failed to prune notifications");
        }
    }

    /// Gives the ticket up without acquiring.
    pub async fn abandon(mut self) {
        self.finished = true;
        self.shared.drop_signal(&self.key, self.ticket);
        if let Err(e) = abandon_ticket(&self.shared, &self.key, self.ticket, self.notified).await {
            warn!(lock.key = %self.key, ticket = self.ticket, error = %e, "failed to abandon wait");
        }
    }
}

/// Releases the store side of a wait that will not be completed, passing the
/// lock on if a release already named the ticket unseen.
async fn abandon_ticket<S: LockStore>(
    shared: &Arc<ListenerShared<S>>,
    key: &str,
    ticket: i64,
    notified: bool,
) -> LockResult<()> {
    shared.store.remove(key, ticket).await?;
    if !notified && shared.store.contains(key, ticket).await? {
        debug!(lock.key = %key, ticket, "abandoned ticket was already notified, passing it on");
        let listener = NotificationListener {
            shared: Arc::clone(shared),
        };
        listener.notify_next(key).await?;
    }
    Ok(())
}

impl<S: LockStore> Drop for WaitSignal<S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.shared.drop_signal(&self.key, self.ticket);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock.key = %self.key, ticket = self.ticket, "wait dropped outside a runtime; entry left to expire");
            return;
        };
        let shared = Arc::clone(&self.shared);
        let key = self.key.clone();
        let ticket = self.ticket;
        let notified = self.notified;
        runtime.spawn(async move {
            if let Err(e) = abandon_ticket(&shared, &key, ticket, notified).await {
                warn!(lock.key = %key, ticket, error = %e, "failed to abandon dropped wait");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockStore;
    use rowlock_core::store::{NotificationLog, SequenceCounter, WaitRegistry};

    const POLL: Duration = Duration::from_millis(50);

    fn listener(store: &MemoryLockStore) -> NotificationListener<MemoryLockStore> {
        NotificationListener::new(
            store.clone(),
            InstanceId::from("test-instance".to_string()),
            POLL,
            Duration::from_secs(30),
        )
    }

    fn in_a_minute() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(1)
    }

    #[tokio::test]
    async fn release_wakes_lowest_ticket_only() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let mut first = listener.enqueue("k", in_a_minute()).await.unwrap();
        let mut second = listener.enqueue("k", in_a_minute()).await.unwrap();
        assert!(first.ticket() < second.ticket());

        assert_eq!(listener.notify_next("k").await.unwrap(), Some(first.ticket()));
        assert_eq!(first.wait(Duration::from_secs(1)).await, WaitOutcome::Notified);
        assert_eq!(second.wait(POLL * 3).await, WaitOutcome::Elapsed);

        // the notified entry is gone, so the next release picks the second one
        assert_eq!(store.wait_entries("k").len(), 1);
        first.complete().await;
        assert!(store.notifications("k").is_empty());

        assert_eq!(listener.notify_next("k").await.unwrap(), Some(second.ticket()));
        assert_eq!(second.wait(Duration::from_secs(1)).await, WaitOutcome::Notified);
        second.complete().await;
    }

    #[tokio::test]
    async fn notify_next_skips_expired_entries() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let stale = listener
            .enqueue("k", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let live = listener.enqueue("k", in_a_minute()).await.unwrap();

        assert_eq!(listener.notify_next("k").await.unwrap(), Some(live.ticket()));
        assert!(!store.exists("k", stale.ticket(), "test-instance").await.unwrap());
        assert_eq!(listener.notify_next("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn notification_before_subscribe_is_not_missed() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        // A ticket that the next enqueue will receive has already been announced.
        store.publish("k", 1).await.unwrap();

        let mut signal = listener.enqueue("k", in_a_minute()).await.unwrap();
        assert_eq!(signal.ticket(), 1);
        assert_eq!(signal.wait(Duration::ZERO).await, WaitOutcome::Notified);
    }

    #[tokio::test]
    async fn late_registered_lower_ticket_is_still_delivered() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        // Ticket 1 is issued but its owner is slow to register.
        let slow_ticket = store.next_ticket("k").await.unwrap();
        let mut second = listener.enqueue("k", in_a_minute()).await.unwrap();
        let _third = listener.enqueue("k", in_a_minute()).await.unwrap();

        assert_eq!(listener.notify_next("k").await.unwrap(), Some(second.ticket()));
        assert_eq!(second.wait(Duration::from_secs(1)).await, WaitOutcome::Notified);

        store
            .register(&WaitEntry {
                lock_key: "k".to_string(),
                sequence: slow_ticket,
                instance_id: "test-instance".to_string(),
                created_at: Utc::now(),
                expire_at: in_a_minute(),
            })
            .await
            .unwrap();
        let receiver = listener.subscribe("k", slow_ticket).unwrap();

        assert_eq!(listener.notify_next("k").await.unwrap(), Some(slow_ticket));
        let delivered = tokio::time::timeout(POLL * 10, receiver).await;
        assert!(matches!(delivered, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn abandoning_a_named_ticket_passes_it_on() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let first = listener.enqueue("k", in_a_minute()).await.unwrap();
        let mut second = listener.enqueue("k", in_a_minute()).await.unwrap();

        // Named, but the waiter gives up before it sees the notification.
        store.publish("k", first.ticket()).await.unwrap();
        store.remove("k", first.ticket()).await.unwrap();
        first.abandon().await;

        assert_eq!(second.wait(Duration::from_secs(1)).await, WaitOutcome::Notified);
    }

    #[tokio::test]
    async fn poller_stops_when_last_waiter_leaves() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let signal = listener.enqueue("k", in_a_minute()).await.unwrap();
        assert_eq!(listener.active_keys(), 1);

        signal.abandon().await;
        tokio::time::sleep(POLL * 3).await;
        assert_eq!(listener.active_keys(), 0);
        assert!(store.wait_entries("k").is_empty());
    }

    #[tokio::test]
    async fn dropped_signal_removes_its_entry() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let signal = listener.enqueue("k", in_a_minute()).await.unwrap();
        drop(signal);

        tokio::time::sleep(POLL).await;
        assert!(store.wait_entries("k").is_empty());
    }

    #[tokio::test]
    async fn sweep_drops_signals_whose_entry_expired() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let mut signal = listener
            .enqueue("k", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        sweep_once(&listener.shared).await;
        assert_eq!(signal.wait(Duration::from_secs(1)).await, WaitOutcome::Lost);
    }

    #[tokio::test]
    async fn shutdown_interrupts_waiters() {
        let store = MemoryLockStore::new();
        let listener = listener(&store);
        let mut signal = listener.enqueue("k", in_a_minute()).await.unwrap();

        listener.shutdown().await;
        assert_eq!(signal.wait(Duration::from_secs(1)).await, WaitOutcome::Lost);
        assert!(listener.is_closed());
        assert!(matches!(
            listener.enqueue("k", in_a_minute()).await,
            Err(LockError::Interrupted)
        ));
    }
}
