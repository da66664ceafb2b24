//! Shared helpers for the integration suites.

#![allow(dead_code)]

pub mod flaky_store;

use std::sync::Once;
use std::time::Duration;

use rowlock::{DatabaseLockClient, LockOptions, LockStore, MemoryLockStore};

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Options scaled down so lease-driven tests finish in a few seconds.
pub fn fast_options() -> LockOptions {
    LockOptions {
        default_lease: Duration::from_millis(600),
        notify_poll_interval: Duration::from_millis(20),
        waiter_sweep_interval: Duration::from_secs(1),
        recheck_interval: Duration::from_millis(500),
        min_busy_wait: Duration::from_millis(10),
        max_busy_wait: Duration::from_millis(100),
        ..LockOptions::default()
    }
}

pub fn client_over<S: LockStore>(store: S, options: LockOptions) -> DatabaseLockClient<S> {
    init_tracing();
    DatabaseLockClient::builder()
        .store(store)
        .options(options)
        .build()
        .unwrap()
}

/// A client over a fresh in-memory store with [`fast_options`].
pub fn memory_client() -> DatabaseLockClient<MemoryLockStore> {
    client_over(MemoryLockStore::new(), fast_options())
}
