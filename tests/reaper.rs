//! Expiry reaper tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlcache::{CacheClient, CacheConfig, ExpiryReaper, RowStore, SqliteRowStore};

async fn test_store() -> Arc<dyn RowStore> {
  let store = SqliteRowStore::in_memory().await.unwrap();
  store.init_schema().await.unwrap();
  Arc::new(store)
}

// =============================================================================
// Manual sweeps
// =============================================================================

#[tokio::test]
async fn test_sweep_now_removes_expired_rows() {
  let store = test_store().await;
  let past = Utc::now() - chrono::TimeDelta::seconds(10);
  store.upsert("expired_1", b"v", Some(past)).await.unwrap();
  store.upsert("expired_2", b"v", Some(past)).await.unwrap();
  store.upsert("live", b"v", None).await.unwrap();

  let reaper = ExpiryReaper::new(store.clone(), Duration::from_secs(60), Duration::from_secs(60));
  assert_eq!(reaper.sweep_now().await, 2);
  assert!(store.find("expired_1").await.unwrap().is_none());
  assert!(store.find("live").await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_now_is_idempotent() {
  let store = test_store().await;
  let past = Utc::now() - chrono::TimeDelta::seconds(10);
  store.upsert("expired", b"v", Some(past)).await.unwrap();

  let reaper = ExpiryReaper::new(store, Duration::from_secs(60), Duration::from_secs(60));
  assert_eq!(reaper.sweep_now().await, 1);
  assert_eq!(reaper.sweep_now().await, 0);
}

#[tokio::test]
async fn test_sweep_ignores_future_expiry() {
  let store = test_store().await;
  let future = Utc::now() + chrono::TimeDelta::seconds(60);
  store.upsert("later", b"v", Some(future)).await.unwrap();

  let reaper = ExpiryReaper::new(store.clone(), Duration::from_secs(60), Duration::from_secs(60));
  assert_eq!(reaper.sweep_now().await, 0);
  assert!(store.find("later").await.unwrap().is_some());
}

// =============================================================================
// Background task lifecycle
// =============================================================================

#[tokio::test]
async fn test_background_loop_sweeps_after_grace() {
  let store = test_store().await;
  let past = Utc::now() - chrono::TimeDelta::seconds(10);
  store.upsert("expired", b"v", Some(past)).await.unwrap();

  let reaper = ExpiryReaper::new(
    store.clone(),
    Duration::from_millis(20),
    Duration::from_millis(20),
  );
  reaper.start();

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(store.find("expired").await.unwrap().is_none());
  reaper.stop(true).await;
}

#[tokio::test]
async fn test_stop_terminates_task() {
  let store = test_store().await;
  let reaper = ExpiryReaper::new(store, Duration::from_millis(10), Duration::from_millis(10));
  reaper.start();
  assert!(reaper.is_running());

  reaper.stop(true).await;
  assert!(!reaper.is_running());
}

#[tokio::test]
async fn test_stop_during_grace_period() {
  let store = test_store().await;
  let reaper = ExpiryReaper::new(store, Duration::from_secs(60), Duration::from_secs(60));
  reaper.start();
  assert!(reaper.is_running());

  // The shutdown signal interrupts the initial grace sleep
  reaper.stop(true).await;
  assert!(!reaper.is_running());
}

#[tokio::test]
async fn test_restart_after_stop() {
  let store = test_store().await;
  let reaper = ExpiryReaper::new(store, Duration::from_millis(10), Duration::from_millis(10));
  reaper.start();
  reaper.stop(true).await;
  assert!(!reaper.is_running());

  reaper.start();
  assert!(reaper.is_running());
  reaper.stop(true).await;
}

#[tokio::test]
async fn test_start_is_idempotent_while_running() {
  let store = test_store().await;
  let reaper = ExpiryReaper::new(store, Duration::from_secs(60), Duration::from_secs(60));
  reaper.start();
  reaper.start();
  assert!(reaper.is_running());
  reaper.stop(true).await;
}

// =============================================================================
// Facade integration
// =============================================================================

#[tokio::test]
async fn test_client_starts_and_stops_reaper() {
  let store = test_store().await;
  let client = CacheClient::with_config(store, CacheConfig::default());
  assert!(client.reaper_is_running());

  client.stop_reaper(true).await;
  assert!(!client.reaper_is_running());
}

#[tokio::test]
async fn test_client_sweep_now_delegates() {
  let store = test_store().await;
  let client = CacheClient::with_config(store, CacheConfig::default());
  client.setex("gone", Duration::from_millis(30), "v").await;

  tokio::time::sleep(Duration::from_millis(80)).await;
  assert_eq!(client.sweep_now().await, 1);
  assert_eq!(client.sweep_now().await, 0);
}
