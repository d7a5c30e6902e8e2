// Integration tests for the lock protocol
// Tests mutual exclusion, fencing, release safety, leases and cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use batata_lock::{
    AcquireError, CancellationToken, CoordinationStore, LockManager, LockOptions, MemoryStore,
    ReleaseError, RetryPolicy, TryAcquireError,
};

fn manager(store: &MemoryStore, owner: &str) -> LockManager {
    LockManager::new(Arc::new(store.clone()), LockOptions::new(owner))
}

fn leased(store: &MemoryStore, owner: &str, ttl: Duration) -> LockManager {
    LockManager::new(
        Arc::new(store.clone()),
        LockOptions::new(owner).with_ttl(ttl),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let store = MemoryStore::new();
    let occupied = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let lock = manager(&store, &format!("node-{i}"));
        let occupied = occupied.clone();
        let entered = entered.clone();
        let tokens = tokens.clone();
        tasks.push(tokio::spawn(async move {
            let policy = RetryPolicy::exponential(Duration::from_millis(1), Duration::from_millis(20));
            let handle = lock
                .acquire("/counter", &policy, &CancellationToken::new())
                .await
                .unwrap();

            assert!(
                !occupied.swap(true, Ordering::SeqCst),
                "two holders inside the critical section"
            );
            entered.fetch_add(1, Ordering::SeqCst);
            tokens.lock().push(handle.token().value());
            tokio::time::sleep(Duration::from_millis(2)).await;
            occupied.store(false, Ordering::SeqCst);

            lock.release(&handle).await.unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(entered.load(Ordering::SeqCst), 16);
    // Every acquisition got a distinct, strictly increasing token
    let tokens = tokens.lock().clone();
    assert_eq!(tokens.len(), 16);
    assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    assert!(store.get("/counter").await.unwrap().is_none());
}

#[tokio::test]
async fn test_two_clients_hand_over_lock() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");
    let b = manager(&store, "client-b");

    let first = a.try_acquire("/my-lock").await.unwrap();

    match b.try_acquire("/my-lock").await {
        Err(TryAcquireError::Contention(c)) => assert_eq!(c.holder_owner(), Some("client-a")),
        other => panic!("expected contention, got {other:?}"),
    }

    a.release(&first).await.unwrap();

    let second = b.try_acquire("/my-lock").await.unwrap();
    assert!(second.token() > first.token());
    assert_eq!(second.owner(), "client-b");
    b.release(&second).await.unwrap();
}

#[tokio::test]
async fn test_waiter_acquires_after_release() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");
    let b = manager(&store, "client-b");

    let held = a.try_acquire("/my-lock").await.unwrap();
    let releaser = a.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        releaser.release(&held).await.unwrap();
    });

    let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(100);
    let handle = b
        .acquire("/my-lock", &policy, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(handle.owner(), "client-b");
    assert!(b.stats().contentions >= 1);
}

#[tokio::test]
async fn test_bounded_retry_makes_exact_attempts() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");
    let b = manager(&store, "client-b");
    let _held = a.try_acquire("/my-lock").await.unwrap();

    for max in [1u32, 3, 7] {
        let before = b.stats().contentions;
        let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(max);
        let err = b
            .acquire("/my-lock", &policy, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquireError::Exhausted { attempts, .. } if attempts == max));
        assert_eq!(b.stats().contentions - before, u64::from(max));
    }

    // A zero bound still makes the one attempt it reports
    let before = b.stats().contentions;
    let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(0);
    let err = b
        .acquire("/my-lock", &policy, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AcquireError::Exhausted { attempts: 1, .. }));
    assert_eq!(b.stats().contentions - before, 1);
}

#[tokio::test]
async fn test_max_elapsed_bounds_acquire() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");
    let b = manager(&store, "client-b");
    let _held = a.try_acquire("/my-lock").await.unwrap();

    let policy = RetryPolicy::fixed(Duration::from_millis(20))
        .with_max_elapsed(Duration::from_millis(100));
    let started = Instant::now();
    let err = b
        .acquire("/my-lock", &policy, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AcquireError::Exhausted { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");

    let handle = a.try_acquire("/my-lock").await.unwrap();
    a.release(&handle).await.unwrap();
    let revision = store.revision();

    a.release(&handle).await.unwrap();
    assert_eq!(store.revision(), revision);
}

#[tokio::test]
async fn test_stale_handle_cannot_release_new_holder() {
    let store = MemoryStore::new();
    let a = leased(&store, "client-a", Duration::from_millis(30));
    let b = manager(&store, "client-b");

    let stale = a.try_acquire("/my-lock").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let current = b.try_acquire("/my-lock").await.unwrap();
    let before = store.get("/my-lock").await.unwrap();

    let err = a.release(&stale).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NotOwner { .. }));
    assert_eq!(store.get("/my-lock").await.unwrap(), before);

    b.release(&current).await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_reclaimed_by_single_contender() {
    let store = MemoryStore::new();
    let crashed = leased(&store, "client-a", Duration::from_millis(30));
    let lost = crashed.try_acquire("/my-lock").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let mut contenders = Vec::new();
    for i in 0..8 {
        let lock = leased(&store, &format!("client-{i}"), Duration::from_secs(30));
        contenders.push(tokio::spawn(async move { lock.try_acquire("/my-lock").await }));
    }

    let mut winners = Vec::new();
    for contender in contenders {
        if let Ok(handle) = contender.await.unwrap() {
            winners.push(handle);
        }
    }

    assert_eq!(winners.len(), 1);
    assert!(winners[0].token() > lost.token());
}

#[tokio::test]
async fn test_keeper_holds_lock_past_ttl() {
    let store = MemoryStore::new();
    let a = leased(&store, "client-a", Duration::from_millis(90));
    let b = leased(&store, "client-b", Duration::from_millis(90));

    let handle = a.try_acquire("/my-lock").await.unwrap();
    let keeper = a.keep_alive(handle, None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.try_acquire("/my-lock").await.is_err());

    let handle = keeper.stop().await.unwrap();
    a.release(&handle).await.unwrap();
    let _handle = b.try_acquire("/my-lock").await.unwrap();
}

#[tokio::test]
async fn test_dropped_exclusive_section_lets_lease_expire() {
    let store = MemoryStore::new();
    let a = leased(&store, "client-a", Duration::from_millis(90));
    let b = leased(&store, "client-b", Duration::from_millis(90));
    let policy = RetryPolicy::no_retry();
    let cancel = CancellationToken::new();

    let section = a.run_exclusive("/my-lock", &policy, &cancel, || async {
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    assert!(
        tokio::time::timeout(Duration::from_millis(50), section)
            .await
            .is_err()
    );
    assert!(b.try_acquire("/my-lock").await.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let handle = b.try_acquire("/my-lock").await.unwrap();
    assert_eq!(handle.owner(), "client-b");
}

#[tokio::test]
async fn test_cancel_stops_waiting_acquire() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");
    let b = manager(&store, "client-b");
    let _held = a.try_acquire("/my-lock").await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            b.acquire("/my-lock", &RetryPolicy::fixed(Duration::from_millis(10)), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AcquireError::Cancelled { .. })));
}

#[tokio::test]
async fn test_transient_store_failures_recovered() {
    let store = MemoryStore::new();
    let a = manager(&store, "client-a");
    store.fail_next(3);

    let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(10);
    let handle = a
        .acquire("/my-lock", &policy, &CancellationToken::new())
        .await
        .unwrap();
    a.release(&handle).await.unwrap();
}
