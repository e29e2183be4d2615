//! Redis-shaped caching over a transactional SQL row store
//!
//! Provides a small cache/lock surface on SQLite or PostgreSQL:
//! - Scalar get/set with optional expiry, set-if-absent, atomic increment
//! - A JSON-object "sorted set" approximation (merge, score-range delete,
//!   cardinality; no ranked iteration)
//! - A non-blocking distributed lock with stale-holder takeover
//! - A background reaper pruning expired rows
//!
//! The underlying store has no native TTL or compare-and-swap, so reads
//! apply a liveness filter, expiry is reclaimed out of band, and races
//! are resolved with unique-key inserts and optimistic value updates.

pub mod client;
pub mod config;
pub mod db;
pub mod lock;
pub mod reaper;
pub mod row;

pub use client::CacheClient;
pub use config::CacheConfig;
pub use db::{PostgresRowStore, RowStore, SqliteRowStore};
pub use lock::{AcquireOutcome, CacheLock, LockError};
pub use reaper::ExpiryReaper;
pub use row::{CacheRow, ToCacheBytes};
