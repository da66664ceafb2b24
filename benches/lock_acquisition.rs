//! Benchmarks for lock acquisition latency

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rowlock::{
    DLock, DatabaseLockClient, Lease, LockClient, LockHandle, MemoryLockStore, OwnerId,
};
use std::time::Duration;

fn bench_memory_lock_acquisition(c: &mut Criterion) {
    let client = DatabaseLockClient::builder()
        .store(MemoryLockStore::new())
        .build()
        .unwrap();
    let lock = client.get_lock("bench-lock").for_owner(OwnerId::named("bench"));

    let mut group = c.benchmark_group("memory_lock");
    group.bench_function("try_lock_unlock", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                if black_box(lock.try_lock().await.unwrap_or(false)) {
                    let _ = lock.unlock().await;
                }
            });
    });

    group.bench_function("acquire_release_guard", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                if let Ok(guard) = lock
                    .acquire(Some(Duration::from_millis(1)), Lease::Default)
                    .await
                {
                    let _ = guard.release().await;
                }
            });
    });

    group.bench_function("reentrant_depth_4", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                for _ in 0..4 {
                    let _ = lock.try_lock().await;
                }
                while lock.hold_count() > 0 {
                    if lock.unlock().await.is_err() {
                        break;
                    }
                }
            });
    });

    group.finish();
}

criterion_group!(benches, bench_memory_lock_acquisition);
criterion_main!(benches);
