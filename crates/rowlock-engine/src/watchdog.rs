//! Lease renewal for locks held in auto-extend mode.
//!
//! One watchdog exists per client. Each renewal is a tokio task keyed by lock
//! key; a semaphore caps how many renewal round-trips run at the same time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rowlock_core::error::{LockError, LockResult};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, warn};

struct RenewalTask {
    id: u64,
    holder: String,
    handle: JoinHandle<()>,
    lost: watch::Sender<bool>,
}

#[derive(Default)]
struct WatchdogState {
    tasks: Mutex<HashMap<String, RenewalTask>>,
    failures: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Keeps auto-extended leases alive until they are cancelled.
#[derive(Clone)]
pub struct Watchdog {
    state: Arc<WatchdogState>,
    permits: Arc<Semaphore>,
}

impl Watchdog {
    pub fn new(pool_size: usize) -> Self {
        Self {
            state: Arc::new(WatchdogState::default()),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Schedules `renew` every `period` after `initial_delay`, replacing any
    /// task already running for `key`.
    ///
    /// `renew` resolves to `Ok(false)` when the record no longer belongs to
    /// `holder`; the task then stops, records a failure for `key` and flips
    /// the returned receiver to `true`. Store errors are retried until a full
    /// `lease` has passed without a successful renewal.
    pub fn submit_renewal_task<F, Fut>(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
        initial_delay: Duration,
        period: Duration,
        mut renew: F,
    ) -> LockResult<watch::Receiver<bool>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = LockResult<bool>> + Send + 'static,
    {
        if self.state.shut_down.load(Ordering::Acquire) {
            return Err(LockError::IllegalState(format!(
                "watchdog is shut down; cannot renew {key}"
            )));
        }

        self.cancel_renewal_task(key);
        self.state.failures.lock().remove(key);

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let (lost_tx, lost_rx) = watch::channel(false);
        let task_lost = lost_tx.clone();
        let state = Arc::downgrade(&self.state);
        let permits = Arc::clone(&self.permits);
        let task_key = key.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_success = Instant::now();

            let failure = loop {
                ticker.tick().await;
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                match renew().await {
                    Ok(true) => {
                        last_success = Instant::now();
                        debug!(lock.key = %task_key, "lease renewed");
                    }
                    Ok(false) => {
                        break "lock record is gone or owned by another holder".to_string();
                    }
                    Err(e) if last_success.elapsed() >= lease => {
                        break format!("no successful renewal within the lease: {e}");
                    }
                    Err(e) => {
                        warn!(lock.key = %task_key, error = %e, "lease renewal attempt failed, will retry");
                    }
                }
            };

            error!(lock.key = %task_key, reason = %failure, "lease renewal failed; lock is no longer safely held");
            if let Some(state) = state.upgrade() {
                state.failures.lock().insert(task_key.clone(), failure);
                let mut tasks = state.tasks.lock();
                if tasks.get(&task_key).is_some_and(|t| t.id == id) {
                    tasks.remove(&task_key);
                }
            }
            let _ = task_lost.send(true);
        });

        self.state.tasks.lock().insert(
            key.to_string(),
            RenewalTask {
                id,
                holder: holder.to_string(),
                handle,
                lost: lost_tx,
            },
        );
        debug!(lock.key = %key, ?period, "renewal task scheduled");
        Ok(lost_rx)
    }

    /// Stops renewing `key`. Calling it for a key without a task is a no-op.
    pub fn cancel_renewal_task(&self, key: &str) -> bool {
        match self.state.tasks.lock().remove(key) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stops renewing `key` only if the running task renews for `holder`.
    pub fn cancel_renewal_for(&self, key: &str, holder: &str) -> bool {
        let mut tasks = self.state.tasks.lock();
        if tasks.get(key).is_some_and(|t| t.holder == holder) {
            if let Some(task) = tasks.remove(key) {
                task.handle.abort();
            }
            return true;
        }
        false
    }

    /// A receiver on the lost signal of the task renewing `key`.
    pub fn subscribe(&self, key: &str) -> Option<watch::Receiver<bool>> {
        self.state.tasks.lock().get(key).map(|t| t.lost.subscribe())
    }

    pub fn is_renewing(&self, key: &str) -> bool {
        self.state.tasks.lock().contains_key(key)
    }

    /// Returns and forgets the last renewal failure recorded for `key`.
    pub fn take_failure(&self, key: &str) -> Option<String> {
        self.state.failures.lock().remove(key)
    }

    pub fn active_tasks(&self) -> usize {
        self.state.tasks.lock().len()
    }

    /// Aborts every renewal and refuses new ones.
    pub async fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::Release);
        self.permits.close();
        let tasks: Vec<RenewalTask> = self.state.tasks.lock().drain().map(|(_, t)| t).collect();
        let count = tasks.len();
        for task in tasks {
            task.handle.abort();
            let _ = task.handle.await;
        }
        debug!(cancelled = count, "watchdog shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const LEASE: Duration = Duration::from_millis(300);
    const PERIOD: Duration = Duration::from_millis(100);

    fn counting(
        calls: &Arc<AtomicUsize>,
        result: fn(usize) -> LockResult<bool>,
    ) -> impl FnMut() -> std::future::Ready<LockResult<bool>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(result(n))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_periodically_until_cancelled() {
        let watchdog = Watchdog::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let lost = watchdog
            .submit_renewal_task("k", "h", LEASE, PERIOD, PERIOD, counting(&calls, |_| Ok(true)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!*lost.borrow());

        assert!(watchdog.cancel_renewal_task("k"));
        assert!(!watchdog.cancel_renewal_task("k"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_row_renewal_stops_and_signals_loss() {
        let watchdog = Watchdog::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut lost = watchdog
            .submit_renewal_task("k", "h", LEASE, PERIOD, PERIOD, counting(&calls, |n| Ok(n < 2)))
            .unwrap();

        lost.changed().await.unwrap();
        assert!(*lost.borrow());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(watchdog.take_failure("k").is_some());
        assert!(watchdog.take_failure("k").is_none());
        assert!(!watchdog.is_renewing("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn store_errors_are_retried_within_the_lease() {
        let watchdog = Watchdog::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let lost = watchdog
            .submit_renewal_task(
                "k",
                "h",
                LEASE,
                PERIOD,
                PERIOD,
                counting(&calls, |n| {
                    if n == 2 {
                        Err(LockError::store("extend", "connection reset"))
                    } else {
                        Ok(true)
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(!*lost.borrow());
        assert!(watchdog.is_renewing("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_store_errors_give_up_after_a_lease() {
        let watchdog = Watchdog::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut lost = watchdog
            .submit_renewal_task(
                "k",
                "h",
                LEASE,
                PERIOD,
                PERIOD,
                counting(&calls, |_| Err(LockError::store("extend", "down"))),
            )
            .unwrap();

        lost.changed().await.unwrap();
        assert!(*lost.borrow());
        assert!(watchdog.take_failure("k").unwrap().contains("down"));
    }

    #[tokio::test(start_paused = true)]
    async fn resubmitting_replaces_the_running_task() {
        let watchdog = Watchdog::new(1);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        watchdog
            .submit_renewal_task("k", "h1", LEASE, PERIOD, PERIOD, counting(&first, |_| Ok(true)))
            .unwrap();
        watchdog
            .submit_renewal_task("k", "h2", LEASE, PERIOD, PERIOD, counting(&second, |_| Ok(true)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(watchdog.active_tasks(), 1);

        assert!(!watchdog.cancel_renewal_for("k", "h1"));
        assert!(watchdog.cancel_renewal_for("k", "h2"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_tasks() {
        let watchdog = Watchdog::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        watchdog
            .submit_renewal_task("k", "h", LEASE, PERIOD, PERIOD, counting(&calls, |_| Ok(true)))
            .unwrap();

        watchdog.shutdown().await;
        assert_eq!(watchdog.active_tasks(), 0);
        assert!(matches!(
            watchdog.submit_renewal_task("k", "h", LEASE, PERIOD, PERIOD, counting(&calls, |_| Ok(true))),
            Err(LockError::IllegalState(_))
        ));
    }
}
