//! Handle pool tests: capacity, FIFO fairness, dispose semantics.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::tempdir;

use tidekv::device::HandlePool;

fn file_pool(dir: &Path, capacity: usize) -> Arc<HandlePool> {
    let path = dir.join("segment.0");
    std::fs::write(&path, b"handle pool test data").unwrap();
    HandlePool::new(capacity, move || {
        std::fs::OpenOptions::new().read(true).open(&path)
    })
}

#[tokio::test]
async fn test_open_handles_never_exceed_capacity() {
    let dir = tempdir().unwrap();
    let pool = file_pool(dir.path(), 3);

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.get().await.unwrap());
        assert!(pool.open_count() <= 3);
    }
    assert_eq!(pool.open_count(), 3);

    // Claims and returns cycle without growing the pool.
    for _ in 0..10 {
        held.pop();
        held.push(pool.get().await.unwrap());
        assert!(pool.open_count() <= 3);
    }
}

#[tokio::test]
async fn test_waiters_are_fifo() {
    let dir = tempdir().unwrap();
    let pool = file_pool(dir.path(), 1);

    let held = pool.get().await.unwrap();
    let delivery_order = Arc::new(Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for i in 0..3usize {
        let pool = Arc::clone(&pool);
        let order = Arc::clone(&delivery_order);
        waiters.push(tokio::spawn(async move {
            let handle = pool.get().await.unwrap();
            order.lock().push(i);
            drop(handle);
        }));
        // Let the waiter register before spawning the next.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    drop(held);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*delivery_order.lock(), vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_claimants_two_handles() {
    let dir = tempdir().unwrap();
    let pool = file_pool(dir.path(), 2);

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let pool = Arc::clone(&pool);
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let handle = pool.get().await.unwrap();
            let now = concurrent.fetch_add(1, Ordering::AcqRel) + 1;
            peak.fetch_max(now, Ordering::AcqRel);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            concurrent.fetch_sub(1, Ordering::AcqRel);
            drop(handle);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::Acquire) <= 2);
    assert_eq!(pool.open_count(), 2);
}

#[tokio::test]
async fn test_returned_handle_reaches_exactly_one_waiter() {
    let dir = tempdir().unwrap();
    let pool = file_pool(dir.path(), 1);

    let held = pool.get().await.unwrap();
    let winners = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let pool = Arc::clone(&pool);
        let winners = Arc::clone(&winners);
        waiters.push(tokio::spawn(async move {
            if let Ok(handle) = pool.get().await {
                winners.fetch_add(1, Ordering::AcqRel);
                // Hold until the test finishes counting.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                drop(handle);
            }
        }));
    }
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    drop(held);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(winners.load(Ordering::Acquire), 1);

    for waiter in waiters {
        waiter.await.unwrap();
    }
}

#[tokio::test]
async fn test_dispose_closes_idle_and_rejects_claims() {
    let dir = tempdir().unwrap();
    let pool = file_pool(dir.path(), 2);

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    drop(b);
    assert_eq!(pool.idle_count(), 1);

    pool.dispose();
    assert!(pool.is_disposed());
    assert_eq!(pool.idle_count(), 0);
    assert!(pool.try_get().is_none());
    assert!(pool.get().await.is_err());

    // In-flight users drain normally; the handle closes on return.
    drop(a);
    assert_eq!(pool.open_count(), 0);
}

#[tokio::test]
async fn test_factory_error_propagates_and_frees_slot() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("no-such-dir").join("segment.0");
    let pool = HandlePool::new(1, move || {
        std::fs::OpenOptions::new().read(true).open(&missing)
    });

    assert!(pool.get().await.is_err());
    // The failed construction releases its capacity slot.
    assert_eq!(pool.open_count(), 0);
}
