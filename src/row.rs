//! Cache row entity and value coercion

use chrono::{DateTime, Utc};

/// A single persisted cache row.
///
/// One row per logical key: scalar values store caller bytes, sorted-set
/// keys store a JSON object of member scores, lock keys store a JSON
/// ownership stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
  /// Surrogate id assigned by the store, never reused
  pub id: i64,
  /// Unique cache key
  pub key: String,
  /// Opaque value bytes
  pub value: Vec<u8>,
  /// Absolute expiry instant; `None` means the row never expires
  pub expire_at: Option<DateTime<Utc>>,
  /// Set once at insertion
  pub created_at: DateTime<Utc>,
}

impl CacheRow {
  /// Whether this row is visible to liveness-filtered reads at `now`
  pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
    self.expire_at.map(|exp| exp > now).unwrap_or(true)
  }
}

/// Conversion into the raw bytes stored for a cache value.
///
/// Byte inputs pass through untouched; text stores its UTF-8 bytes;
/// numbers and bools store their decimal/text representation, so values
/// round-trip for callers that read them back as text (e.g. counters).
pub trait ToCacheBytes {
  fn to_cache_bytes(&self) -> Vec<u8>;
}

impl<T: ToCacheBytes + ?Sized> ToCacheBytes for &T {
  fn to_cache_bytes(&self) -> Vec<u8> {
    (**self).to_cache_bytes()
  }
}

impl ToCacheBytes for [u8] {
  fn to_cache_bytes(&self) -> Vec<u8> {
    self.to_vec()
  }
}

impl<const N: usize> ToCacheBytes for [u8; N] {
  fn to_cache_bytes(&self) -> Vec<u8> {
    self.to_vec()
  }
}

impl ToCacheBytes for Vec<u8> {
  fn to_cache_bytes(&self) -> Vec<u8> {
    self.clone()
  }
}

impl ToCacheBytes for str {
  fn to_cache_bytes(&self) -> Vec<u8> {
    self.as_bytes().to_vec()
  }
}

impl ToCacheBytes for String {
  fn to_cache_bytes(&self) -> Vec<u8> {
    self.as_bytes().to_vec()
  }
}

macro_rules! impl_to_cache_bytes_via_display {
  ($($t:ty),*) => {
    $(impl ToCacheBytes for $t {
      fn to_cache_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
      }
    })*
  };
}

impl_to_cache_bytes_via_display!(i32, i64, u32, u64, f64, bool);
