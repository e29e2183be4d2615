//! Abstract row store backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::row::CacheRow;

/// Transactional row store behind the cache facade and lock.
///
/// One logical table maps a unique text key to opaque value bytes and an
/// optional absolute expiry. Each method is a single self-contained
/// statement: it either fully commits or leaves the table untouched, so
/// no caller ever observes partial row state.
#[async_trait]
pub trait RowStore: Send + Sync {
  /// Create the caches table and its indexes (idempotent)
  async fn init_schema(&self) -> Result<(), anyhow::Error>;

  /// Lookup applying the liveness filter:
  /// `expire_time IS NULL OR expire_time > now`
  async fn find_live(
    &self,
    key: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<CacheRow>, anyhow::Error>;

  /// Lookup ignoring expiry; expired-but-unreaped rows are still returned
  async fn find(&self, key: &str) -> Result<Option<CacheRow>, anyhow::Error>;

  /// Multi-key lookup ignoring expiry
  async fn find_many(&self, keys: &[String]) -> Result<Vec<CacheRow>, anyhow::Error>;

  /// Insert or overwrite value and expiry for a key in one statement
  async fn upsert(
    &self,
    key: &str,
    value: &[u8],
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<(), anyhow::Error>;

  /// Strict insert; errors on an existing key (unique constraint), which
  /// is how setnx and lock acquisition detect a concurrent racer
  async fn insert(
    &self,
    key: &str,
    value: &[u8],
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<(), anyhow::Error>;

  /// Delete all matching rows in one statement, returning the count removed
  async fn delete(&self, keys: &[String]) -> Result<usize, anyhow::Error>;

  /// Delete every row whose expiry has passed (the reaper's sweep)
  async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, anyhow::Error>;

  /// Overwrite only the value of an existing row.
  ///
  /// With `expected` set this is an optimistic compare-and-swap: the
  /// update applies only while the stored value still equals `expected`.
  /// With `expected = None` the overwrite is unconditional. Returns
  /// whether a row was affected. Never touches the expiry column.
  async fn update_value_if(
    &self,
    key: &str,
    expected: Option<&[u8]>,
    value: &[u8],
  ) -> Result<bool, anyhow::Error>;

  /// Overwrite only the expiry of an existing row; false when the key is
  /// absent
  async fn update_expiry(
    &self,
    key: &str,
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<bool, anyhow::Error>;
}
