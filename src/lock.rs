//! Non-blocking mutual exclusion on top of the row store

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::RowStore;

/// Lock errors surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum LockError {
  #[error("failed to acquire lock: {0}")]
  NotAcquired(String),
}

/// Outcome of a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
  /// No lock row existed; ours was inserted
  Inserted,
  /// This instance already held the lock
  AlreadyHeld,
  /// The previous holder's stamp was stale (or undecodable) and the
  /// compare-and-swap claimed the row
  TookOver,
  /// Another owner holds the lock and is not yet stale
  HeldByOther,
  /// A concurrent racer inserted or re-stamped the row first
  LostRace,
}

/// Identity recorded in a lock row to verify release authority
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnerStamp {
  process_id: u32,
  thread_id: String,
  #[serde(default)]
  timestamp: f64,
}

fn now_secs() -> f64 {
  Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Non-blocking lock keyed by name, stored as a `lock_<name>` row.
///
/// Ownership is a process/thread identity stamp, not a per-acquisition
/// token: a holder that crashes without releasing and is later replaced
/// by an instance with the same identity cannot be told apart on
/// release. The identity is sampled once at construction so that acquire
/// and release agree even when the executor migrates the task between
/// worker threads.
pub struct CacheLock {
  store: Arc<dyn RowStore>,
  name: String,
  timeout: Option<Duration>,
  process_id: u32,
  thread_id: String,
  locked: bool,
}

impl CacheLock {
  pub fn new(store: Arc<dyn RowStore>, name: &str, timeout: Option<Duration>) -> Self {
    Self {
      store,
      name: name.to_string(),
      timeout,
      process_id: std::process::id(),
      thread_id: format!("{:?}", std::thread::current().id()),
      locked: false,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  fn lock_key(&self) -> String {
    format!("lock_{}", self.name)
  }

  /// Attempt to take the lock without blocking.
  ///
  /// Returns true when this instance holds the lock afterwards.
  /// Requesting `blocking` acquisition is a contract violation and
  /// panics.
  pub async fn acquire(&mut self, blocking: bool) -> bool {
    if self.locked {
      return true;
    }
    assert!(!blocking, "CacheLock does not support blocking acquisition");
    matches!(
      self.try_acquire().await,
      AcquireOutcome::Inserted | AcquireOutcome::TookOver | AcquireOutcome::AlreadyHeld
    )
  }

  /// Single acquisition attempt with the explicit tagged outcome
  pub async fn try_acquire(&mut self) -> AcquireOutcome {
    if self.locked {
      return AcquireOutcome::AlreadyHeld;
    }
    let outcome = self.attempt().await;
    if matches!(outcome, AcquireOutcome::Inserted | AcquireOutcome::TookOver) {
      self.locked = true;
    }
    outcome
  }

  async fn attempt(&self) -> AcquireOutcome {
    let key = self.lock_key();
    let now = now_secs();
    let stamp = OwnerStamp {
      process_id: self.process_id,
      thread_id: self.thread_id.clone(),
      timestamp: now,
    };
    let encoded = match serde_json::to_vec(&stamp) {
      Ok(bytes) => bytes,
      Err(e) => {
        tracing::warn!("lock {} stamp encoding failed: {}", self.name, e);
        return AcquireOutcome::LostRace;
      }
    };

    let row = match self.store.find(&key).await {
      Ok(row) => row,
      Err(e) => {
        tracing::warn!("lock {} acquire failed: {}", self.name, e);
        return AcquireOutcome::LostRace;
      }
    };

    match row {
      None => match self.store.insert(&key, &encoded, None).await {
        Ok(()) => AcquireOutcome::Inserted,
        // A concurrent racer inserted the row first
        Err(_) => AcquireOutcome::LostRace,
      },
      Some(row) => match serde_json::from_slice::<OwnerStamp>(&row.value) {
        Ok(existing) => {
          let stale = self
            .timeout
            .map(|t| now - existing.timestamp > t.as_secs_f64())
            .unwrap_or(false);
          if !stale {
            return AcquireOutcome::HeldByOther;
          }
          // Optimistic takeover: only succeeds while the row still holds
          // the exact stamp read above
          match self
            .store
            .update_value_if(&key, Some(row.value.as_slice()), &encoded)
            .await
          {
            Ok(true) => AcquireOutcome::TookOver,
            Ok(false) => AcquireOutcome::LostRace,
            Err(e) => {
              tracing::warn!("lock {} takeover failed: {}", self.name, e);
              AcquireOutcome::LostRace
            }
          }
        }
        Err(_) => {
          // Undecodable stamp: the row is garbage, claim it outright
          match self.store.update_value_if(&key, None, &encoded).await {
            Ok(true) => AcquireOutcome::TookOver,
            Ok(false) => AcquireOutcome::LostRace,
            Err(e) => {
              tracing::warn!("lock {} takeover failed: {}", self.name, e);
              AcquireOutcome::LostRace
            }
          }
        }
      },
    }
  }

  /// Release the lock if this instance holds it.
  ///
  /// The row is deleted only when its stored stamp still matches this
  /// instance's identity; after a stale takeover the new owner's row is
  /// left untouched. The local held flag is always cleared.
  pub async fn release(&mut self) {
    if !self.locked {
      return;
    }
    let key = self.lock_key();
    match self.store.find(&key).await {
      Ok(Some(row)) => {
        if let Ok(existing) = serde_json::from_slice::<OwnerStamp>(&row.value) {
          if existing.process_id == self.process_id && existing.thread_id == self.thread_id {
            if let Err(e) = self.store.delete(&[key]).await {
              tracing::warn!("lock {} release failed: {}", self.name, e);
            }
          }
        }
      }
      Ok(None) => {}
      Err(e) => tracing::warn!("lock {} release failed: {}", self.name, e),
    }
    self.locked = false;
  }

  /// Run `f` while holding the lock; releases on every exit path.
  ///
  /// Fails with [`LockError::NotAcquired`] when the lock cannot be
  /// taken, in which case `f` never runs.
  pub async fn with_lock<T, F, Fut>(&mut self, f: F) -> Result<T, LockError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    if !self.acquire(false).await {
      return Err(LockError::NotAcquired(self.name.clone()));
    }
    let out = f().await;
    self.release().await;
    Ok(out)
  }
}
