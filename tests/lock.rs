//! Non-blocking lock tests

use std::sync::Arc;
use std::time::Duration;

use sqlcache::{AcquireOutcome, CacheLock, LockError, RowStore, SqliteRowStore};

async fn test_store() -> Arc<dyn RowStore> {
  let store = SqliteRowStore::in_memory().await.unwrap();
  store.init_schema().await.unwrap();
  Arc::new(store)
}

// =============================================================================
// Acquire / release
// =============================================================================

#[tokio::test]
async fn test_acquire_and_release() {
  let store = test_store().await;
  let mut lock = CacheLock::new(store.clone(), "job", None);
  assert!(lock.acquire(false).await);
  lock.release().await;

  let mut second = CacheLock::new(store, "job", None);
  assert!(second.acquire(false).await);
}

#[tokio::test]
async fn test_mutual_exclusion() {
  let store = test_store().await;
  let mut first = CacheLock::new(store.clone(), "job", Some(Duration::from_secs(30)));
  let mut second = CacheLock::new(store, "job", Some(Duration::from_secs(30)));

  assert!(first.acquire(false).await);
  assert!(!second.acquire(false).await);
  assert_eq!(second.try_acquire().await, AcquireOutcome::HeldByOther);

  first.release().await;
  assert!(second.acquire(false).await);
}

#[tokio::test]
async fn test_acquire_idempotent_for_holder() {
  let store = test_store().await;
  let mut lock = CacheLock::new(store, "job", None);
  assert!(lock.acquire(false).await);
  assert!(lock.acquire(false).await);
  assert_eq!(lock.try_acquire().await, AcquireOutcome::AlreadyHeld);
}

#[tokio::test]
async fn test_locks_by_name_are_independent() {
  let store = test_store().await;
  let mut a = CacheLock::new(store.clone(), "alpha", None);
  let mut b = CacheLock::new(store, "beta", None);
  assert!(a.acquire(false).await);
  assert!(b.acquire(false).await);
}

#[tokio::test]
async fn test_release_without_hold_is_noop() {
  let store = test_store().await;
  let mut holder = CacheLock::new(store.clone(), "job", None);
  assert!(holder.acquire(false).await);

  // An instance that never acquired must not delete the holder's row
  let mut bystander = CacheLock::new(store.clone(), "job", None);
  bystander.release().await;
  assert!(store.find("lock_job").await.unwrap().is_some());
}

// =============================================================================
// Staleness / takeover
// =============================================================================

#[tokio::test]
async fn test_no_timeout_means_never_stale() {
  let store = test_store().await;
  let mut first = CacheLock::new(store.clone(), "job", None);
  assert!(first.acquire(false).await);

  tokio::time::sleep(Duration::from_millis(80)).await;
  let mut second = CacheLock::new(store, "job", None);
  assert!(!second.acquire(false).await);
}

#[tokio::test]
async fn test_takeover_after_staleness_timeout() {
  let store = test_store().await;
  let mut first = CacheLock::new(store.clone(), "job", Some(Duration::from_millis(50)));
  assert!(first.acquire(false).await);

  let mut second = CacheLock::new(store.clone(), "job", Some(Duration::from_millis(50)));
  assert!(!second.acquire(false).await);

  tokio::time::sleep(Duration::from_millis(120)).await;
  assert_eq!(second.try_acquire().await, AcquireOutcome::TookOver);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_after_takeover_is_noop() {
  let store = test_store().await;

  // Construct the first holder on a different thread so its ownership
  // stamp differs from the taker's
  let mut first = {
    let store = store.clone();
    tokio::task::spawn_blocking(move || {
      CacheLock::new(store, "job", Some(Duration::from_millis(50)))
    })
    .await
    .unwrap()
  };
  assert!(first.acquire(false).await);

  tokio::time::sleep(Duration::from_millis(120)).await;
  let mut second = CacheLock::new(store.clone(), "job", Some(Duration::from_millis(50)));
  assert_eq!(second.try_acquire().await, AcquireOutcome::TookOver);

  // The original holder's release must not delete the taker's row
  first.release().await;
  assert!(store.find("lock_job").await.unwrap().is_some());
}

#[tokio::test]
async fn test_corrupt_lock_row_is_claimed() {
  let store = test_store().await;
  store.upsert("lock_job", b"garbage bytes", None).await.unwrap();

  let mut lock = CacheLock::new(store, "job", None);
  assert_eq!(lock.try_acquire().await, AcquireOutcome::TookOver);
}

// =============================================================================
// Contract violations and scoped use
// =============================================================================

#[tokio::test]
#[should_panic(expected = "blocking acquisition")]
async fn test_blocking_acquire_panics() {
  let store = test_store().await;
  let mut lock = CacheLock::new(store, "job", None);
  lock.acquire(true).await;
}

#[tokio::test]
async fn test_with_lock_runs_body_and_releases() {
  let store = test_store().await;
  let mut lock = CacheLock::new(store.clone(), "job", None);
  let result = lock.with_lock(|| async { 41 + 1 }).await.unwrap();
  assert_eq!(result, 42);

  // Released on exit: another instance can acquire
  let mut second = CacheLock::new(store, "job", None);
  assert!(second.acquire(false).await);
}

#[tokio::test]
async fn test_with_lock_fails_when_held() {
  let store = test_store().await;
  let mut holder = CacheLock::new(store.clone(), "job", Some(Duration::from_secs(30)));
  assert!(holder.acquire(false).await);

  let mut contender = CacheLock::new(store, "job", Some(Duration::from_secs(30)));
  let ran = std::sync::atomic::AtomicBool::new(false);
  let result = contender
    .with_lock(|| async {
      ran.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .await;
  assert!(matches!(result, Err(LockError::NotAcquired(name)) if name == "job"));
  assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
}
