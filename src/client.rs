//! Redis-shaped cache facade over the row store

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::CacheConfig;
use crate::db::RowStore;
use crate::lock::CacheLock;
use crate::reaper::ExpiryReaper;
use crate::row::ToCacheBytes;

/// Bound on optimistic retries for `incr` under write contention
const INCR_MAX_RETRIES: usize = 64;

fn expiry_for(ttl: Duration) -> DateTime<Utc> {
  let delta = chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX);
  Utc::now()
    .checked_add_signed(delta)
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decode_zset(bytes: &[u8]) -> Option<serde_json::Map<String, Value>> {
  match serde_json::from_slice::<Value>(bytes) {
    Ok(Value::Object(map)) => Some(map),
    _ => None,
  }
}

/// Scalar cache operations plus the JSON-map sorted-set approximation.
///
/// Every operation is its own bounded read-modify-write against the row
/// store; there is no multi-key atomicity across calls. Store faults are
/// caught at this boundary, logged, and degrade to cache-miss-like
/// defaults, so callers cannot distinguish "absent" from "fault" on
/// read-style operations.
pub struct CacheClient {
  store: Arc<dyn RowStore>,
  reaper: Arc<ExpiryReaper>,
}

impl CacheClient {
  /// Build a client with default sweep timings and start its reaper.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn new(store: Arc<dyn RowStore>) -> Self {
    Self::with_config(store, CacheConfig::default())
  }

  pub fn with_config(store: Arc<dyn RowStore>, config: CacheConfig) -> Self {
    let reaper = Arc::new(ExpiryReaper::new(
      store.clone(),
      Duration::from_secs(config.sweep_grace_secs),
      Duration::from_secs(config.sweep_interval_secs),
    ));
    reaper.start();
    Self { store, reaper }
  }

  /// Live-row lookup; expired-but-unreaped rows read as absent
  pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
    match self.store.find_live(key, Utc::now()).await {
      Ok(row) => row.map(|r| r.value),
      Err(e) => {
        tracing::warn!("cache get {} failed: {}", key, e);
        None
      }
    }
  }

  /// Multi-key lookup; results follow the order of `keys`, with `None`
  /// for absent or expired entries
  pub async fn mget(&self, keys: &[&str]) -> Vec<Option<Vec<u8>>> {
    if keys.is_empty() {
      return Vec::new();
    }
    let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    match self.store.find_many(&owned).await {
      Ok(rows) => {
        let now = Utc::now();
        let mut by_key: std::collections::HashMap<String, Vec<u8>> = rows
          .into_iter()
          .filter(|r| r.is_live_at(now))
          .map(|r| (r.key.clone(), r.value))
          .collect();
        keys.iter().map(|k| by_key.remove(*k)).collect()
      }
      Err(e) => {
        tracing::warn!("cache mget {:?} failed: {}", keys, e);
        vec![None; keys.len()]
      }
    }
  }

  /// Upsert a value, with absolute expiry `now + ttl` when given
  pub async fn set(&self, key: &str, value: impl ToCacheBytes, ttl: Option<Duration>) {
    let bytes = value.to_cache_bytes();
    let expire_at = ttl.map(expiry_for);
    if let Err(e) = self.store.upsert(key, &bytes, expire_at).await {
      tracing::warn!("cache set {} failed: {}", key, e);
    }
  }

  /// `set` with a mandatory expiry
  pub async fn setex(&self, key: &str, ttl: Duration, value: impl ToCacheBytes) {
    self.set(key, value, Some(ttl)).await;
  }

  /// Insert only when no row exists for the key. An expired-but-unreaped
  /// row still counts as existing: the check is against raw table state,
  /// not the liveness filter.
  pub async fn setnx(&self, key: &str, value: impl ToCacheBytes) {
    let bytes = value.to_cache_bytes();
    match self.store.find(key).await {
      Ok(Some(_)) => {}
      Ok(None) => {
        // A concurrent insert losing this race is swallowed like any
        // other store fault; the first writer wins either way
        if let Err(e) = self.store.insert(key, &bytes, None).await {
          tracing::warn!("cache setnx {} failed: {}", key, e);
        }
      }
      Err(e) => tracing::warn!("cache setnx {} failed: {}", key, e),
    }
  }

  /// Remove all matching rows in one statement
  pub async fn delete(&self, keys: &[&str]) {
    if keys.is_empty() {
      return;
    }
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    if let Err(e) = self.store.delete(&keys).await {
      tracing::warn!("cache delete {:?} failed: {}", keys, e);
    }
  }

  /// Add `amount` to the decimal-text integer stored under `key`,
  /// treating an absent key as 0. Returns the new value's decimal bytes,
  /// or `b"0"` on fault (including a stored value that is not a base-10
  /// integer). Concurrent increments retry optimistically and never lose
  /// updates.
  pub async fn incr(&self, key: &str, amount: i64) -> Vec<u8> {
    for _ in 0..INCR_MAX_RETRIES {
      match self.try_incr(key, amount).await {
        Ok(Some(bytes)) => return bytes,
        Ok(None) => continue,
        Err(e) => {
          tracing::warn!("cache incr {} failed: {}", key, e);
          return b"0".to_vec();
        }
      }
    }
    tracing::warn!("cache incr {} gave up after {} retries", key, INCR_MAX_RETRIES);
    b"0".to_vec()
  }

  /// One optimistic attempt; `Ok(None)` means a racer won, retry
  async fn try_incr(&self, key: &str, amount: i64) -> Result<Option<Vec<u8>>, anyhow::Error> {
    match self.store.find(key).await? {
      Some(row) => {
        let current: i64 = std::str::from_utf8(&row.value)?.trim().parse()?;
        let next = (current + amount).to_string().into_bytes();
        if self
          .store
          .update_value_if(key, Some(row.value.as_slice()), &next)
          .await?
        {
          Ok(Some(next))
        } else {
          Ok(None)
        }
      }
      None => {
        let fresh = amount.to_string().into_bytes();
        match self.store.insert(key, &fresh, None).await {
          Ok(()) => Ok(Some(fresh)),
          // A concurrent insert won; retry against the existing row
          Err(_) => Ok(None),
        }
      }
    }
  }

  /// Refresh the expiry of an existing row to `now + ttl`; no-op when
  /// the key is absent
  pub async fn expire(&self, key: &str, ttl: Duration) {
    if let Err(e) = self.store.update_expiry(key, Some(expiry_for(ttl))).await {
      tracing::warn!("cache expire {} failed: {}", key, e);
    }
  }

  /// Merge member scores into the JSON object stored under `key`,
  /// creating it when absent. Undecodable existing content is discarded
  /// and replaced by `mapping` alone.
  pub async fn zadd(&self, key: &str, mapping: &[(&str, f64)]) {
    let row = match self.store.find(key).await {
      Ok(row) => row,
      Err(e) => {
        tracing::warn!("cache zadd {} failed: {}", key, e);
        return;
      }
    };

    let expire_at = row.as_ref().and_then(|r| r.expire_at);
    let mut object = row
      .as_ref()
      .and_then(|r| decode_zset(&r.value))
      .unwrap_or_default();
    for (member, score) in mapping {
      object.insert(member.to_string(), Value::from(*score));
    }

    let bytes = match serde_json::to_vec(&object) {
      Ok(bytes) => bytes,
      Err(e) => {
        tracing::warn!("cache zadd {} failed: {}", key, e);
        return;
      }
    };
    if let Err(e) = self.store.upsert(key, &bytes, expire_at).await {
      tracing::warn!("cache zadd {} failed: {}", key, e);
    }
  }

  /// Remove every member whose score falls in `[min, max]` inclusive
  /// from the stored JSON object, returning the count removed. Pass
  /// `f64::NEG_INFINITY` / `f64::INFINITY` for open bounds. Members with
  /// non-numeric scores are skipped, not removed. Absent or corrupt
  /// content yields 0.
  pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> usize {
    let row = match self.store.find(key).await {
      Ok(Some(row)) => row,
      Ok(None) => return 0,
      Err(e) => {
        tracing::warn!("cache zremrangebyscore {} failed: {}", key, e);
        return 0;
      }
    };
    let Some(mut object) = decode_zset(&row.value) else {
      return 0;
    };

    let to_remove: Vec<String> = object
      .iter()
      .filter(|(_, score)| {
        score
          .as_f64()
          .map(|s| min <= s && s <= max)
          .unwrap_or(false)
      })
      .map(|(member, _)| member.clone())
      .collect();
    for member in &to_remove {
      object.remove(member);
    }

    let bytes = match serde_json::to_vec(&object) {
      Ok(bytes) => bytes,
      Err(e) => {
        tracing::warn!("cache zremrangebyscore {} failed: {}", key, e);
        return 0;
      }
    };
    if let Err(e) = self.store.upsert(key, &bytes, row.expire_at).await {
      tracing::warn!("cache zremrangebyscore {} failed: {}", key, e);
      return 0;
    }
    to_remove.len()
  }

  /// Size of the JSON object stored under `key`; 0 when absent or corrupt
  pub async fn zcard(&self, key: &str) -> usize {
    match self.store.find(key).await {
      Ok(Some(row)) => decode_zset(&row.value).map(|o| o.len()).unwrap_or(0),
      Ok(None) => 0,
      Err(e) => {
        tracing::warn!("cache zcard {} failed: {}", key, e);
        0
      }
    }
  }

  /// Build a non-blocking lock on this client's store
  pub fn lock(&self, name: &str, timeout: Option<Duration>) -> CacheLock {
    CacheLock::new(self.store.clone(), name, timeout)
  }

  /// Compatibility shim: this facade has no batching, every call applies
  /// immediately
  pub fn pipeline(&self) -> &Self {
    self
  }

  /// Run one expiry sweep immediately; see [`ExpiryReaper::sweep_now`]
  pub async fn sweep_now(&self) -> usize {
    self.reaper.sweep_now().await
  }

  /// Stop the background reaper; see [`ExpiryReaper::stop`]
  pub async fn stop_reaper(&self, wait: bool) {
    self.reaper.stop(wait).await;
  }

  /// Whether the background reaper task is alive
  pub fn reaper_is_running(&self) -> bool {
    self.reaper.is_running()
  }
}
