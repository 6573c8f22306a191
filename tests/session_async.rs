//! Async session tests: awaitable point operations and cooperative
//! cancellation.

use std::sync::Arc;

use tempfile::tempdir;

use tidekv::device::{SegmentedDevice, SegmentedDeviceOptions};
use tidekv::locking::{sort_lockable_keys, LockableKey};
use tidekv::status::Status;
use tidekv::store::{
    with_cancellation, BasicFunctions, CancellationToken, LockableSession, StoreCore, StoreOptions,
};

fn lock_exclusive(session: &mut LockableSession<u64, u64>, key: u64) -> Vec<LockableKey> {
    let code = session.lock_code_for(&key).unwrap();
    let mut keys = vec![LockableKey::exclusive(code)];
    sort_lockable_keys(&mut keys);
    session.lock(&keys);
    keys
}

#[tokio::test]
async fn test_async_point_operations() {
    let store = StoreCore::<u64, u64>::in_memory(StoreOptions::default());
    let mut session = store.lockable_session();
    session.begin_lockable();
    let keys = lock_exclusive(&mut session, 1);

    let token = CancellationToken::new();
    let mut functions = BasicFunctions::new();

    assert_eq!(
        session.upsert_async(&mut functions, &1, &11, &token).await,
        Status::Ok
    );
    assert_eq!(
        session.read_async(&mut functions, &1, &token).await,
        Status::Ok
    );
    assert_eq!(functions.take_read(), Some(11));

    assert_eq!(
        session.rmw_async(&mut functions, &1, &22, &token).await,
        Status::Ok
    );
    assert_eq!(
        session.read_async(&mut functions, &1, &token).await,
        Status::Ok
    );
    assert_eq!(functions.take_read(), Some(22));

    assert_eq!(
        session.delete_async(&mut functions, &1, &token).await,
        Status::Ok
    );
    assert_eq!(
        session.read_async(&mut functions, &1, &token).await,
        Status::NotFound
    );

    session.unlock(&keys);
    session.end_lockable();
}

#[tokio::test]
async fn test_cancelled_token_short_circuits() {
    let store = StoreCore::<u64, u64>::in_memory(StoreOptions::default());
    let mut session = store.lockable_session();
    session.begin_lockable();
    let keys = lock_exclusive(&mut session, 2);

    let token = CancellationToken::new();
    token.cancel();
    let mut functions = BasicFunctions::new();

    assert_eq!(
        session.upsert_async(&mut functions, &2, &5, &token).await,
        Status::Cancelled
    );
    // The operation never ran.
    assert_eq!(session.read_value(&2).unwrap(), None);

    assert_eq!(
        session.read_async(&mut functions, &2, &token).await,
        Status::Cancelled
    );
    assert_eq!(
        session.complete_pending_async(&token).await,
        Status::Cancelled
    );

    session.unlock(&keys);
    session.end_lockable();
}

#[tokio::test]
async fn test_complete_pending_async_drains() {
    let store = StoreCore::<u64, u64>::in_memory(StoreOptions::default());
    let mut session = store.lockable_session();

    let token = CancellationToken::new();
    // Nothing outstanding: resolves immediately.
    assert_eq!(session.complete_pending_async(&token).await, Status::Ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_async_with_device() {
    let dir = tempdir().unwrap();
    let device = SegmentedDevice::create(
        dir.path().join("log"),
        SegmentedDeviceOptions::default(),
    )
    .unwrap();
    let store =
        StoreCore::<u64, u64>::with_device(StoreOptions::default(), Arc::clone(&device)).unwrap();

    let mut session = store.lockable_session();
    session.begin_lockable();
    let keys = lock_exclusive(&mut session, 3);

    let token = CancellationToken::new();
    let mut functions = BasicFunctions::new();
    for i in 0..5u64 {
        session.upsert_async(&mut functions, &3, &i, &token).await;
    }
    assert_eq!(
        session.commit_async(&mut functions, &token).await,
        Status::Ok
    );
    assert!(session.latest_commit_point().is_some());
    assert!(store.flushed_until() >= 512);

    session.unlock(&keys);
    session.end_lockable();
}

#[tokio::test]
async fn test_with_cancellation_inner_work_survives() {
    let token = CancellationToken::new();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<u64>();

    let result = {
        let token_inner = token.clone();
        tokio::spawn(async move {
            started_rx.await.unwrap();
            token_inner.cancel();
        });
        with_cancellation(&token, async move {
            started_tx.send(()).unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            done_tx.send(99).unwrap();
        })
        .await
    };

    assert_eq!(result, Err(Status::Cancelled));
    // The raced task completed into the void.
    assert_eq!(done_rx.await, Ok(99));
}
