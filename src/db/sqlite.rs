//! SQLite row store backend

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use tokio_rusqlite::Connection;

use super::store::RowStore;
use crate::row::CacheRow;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_key TEXT NOT NULL UNIQUE,
    cache_value BLOB NOT NULL,
    expire_time TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_caches_cache_key ON caches(cache_key);
CREATE INDEX IF NOT EXISTS idx_caches_expire_time ON caches(expire_time);
"#;

const ROW_COLUMNS: &str = "id, cache_key, cache_value, expire_time, created_at";

/// Encode an instant as fixed-width RFC3339 so that string comparison in
/// SQL matches chronological comparison.
fn encode_ts(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> Result<CacheRow, rusqlite::Error> {
  let expire: Option<String> = row.get(3)?;
  let created: String = row.get(4)?;
  Ok(CacheRow {
    id: row.get(0)?,
    key: row.get(1)?,
    value: row.get(2)?,
    expire_at: expire.as_deref().map(parse_ts).transpose()?,
    created_at: parse_ts(&created)?,
  })
}

/// Row store backed by a single SQLite connection.
///
/// All calls are serialized onto one worker thread by `tokio_rusqlite`,
/// so each statement runs to completion before the next begins.
pub struct SqliteRowStore {
  conn: Connection,
}

impl SqliteRowStore {
  pub async fn new(path: &str) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };

    // Apply performance pragmas
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(|e| e.into()))
      .await?;

    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:").await
  }
}

#[async_trait]
impl RowStore for SqliteRowStore {
  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self
      .conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    tracing::info!("SQLite caches schema initialized");
    Ok(())
  }

  async fn find_live(
    &self,
    key: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<CacheRow>, anyhow::Error> {
    let key = key.to_string();
    let now_s = encode_ts(now);
    let row = self
      .conn
      .call(move |conn| {
        conn
          .query_row(
            &format!(
              "SELECT {} FROM caches WHERE cache_key = ?1 \
               AND (expire_time IS NULL OR expire_time > ?2)",
              ROW_COLUMNS
            ),
            params![key, now_s],
            row_from_sql,
          )
          .optional()
          .map_err(|e| e.into())
      })
      .await?;
    Ok(row)
  }

  async fn find(&self, key: &str) -> Result<Option<CacheRow>, anyhow::Error> {
    let key = key.to_string();
    let row = self
      .conn
      .call(move |conn| {
        conn
          .query_row(
            &format!("SELECT {} FROM caches WHERE cache_key = ?1", ROW_COLUMNS),
            params![key],
            row_from_sql,
          )
          .optional()
          .map_err(|e| e.into())
      })
      .await?;
    Ok(row)
  }

  async fn find_many(&self, keys: &[String]) -> Result<Vec<CacheRow>, anyhow::Error> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let keys = keys.to_vec();
    let rows = self
      .conn
      .call(move |conn| {
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
          "SELECT {} FROM caches WHERE cache_key IN ({})",
          ROW_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params_from_iter(keys.iter()), row_from_sql)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn upsert(
    &self,
    key: &str,
    value: &[u8],
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<(), anyhow::Error> {
    let key = key.to_string();
    let value = value.to_vec();
    let expire_s = expire_at.map(encode_ts);
    let created_s = encode_ts(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO caches (cache_key, cache_value, expire_time, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(cache_key) DO UPDATE SET \
             cache_value = excluded.cache_value, expire_time = excluded.expire_time",
            params![key, value, expire_s, created_s],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn insert(
    &self,
    key: &str,
    value: &[u8],
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<(), anyhow::Error> {
    let key = key.to_string();
    let value = value.to_vec();
    let expire_s = expire_at.map(encode_ts);
    let created_s = encode_ts(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO caches (cache_key, cache_value, expire_time, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![key, value, expire_s, created_s],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn delete(&self, keys: &[String]) -> Result<usize, anyhow::Error> {
    if keys.is_empty() {
      return Ok(0);
    }
    let keys = keys.to_vec();
    let affected = self
      .conn
      .call(move |conn| {
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("DELETE FROM caches WHERE cache_key IN ({})", placeholders);
        conn
          .execute(&sql, params_from_iter(keys.iter()))
          .map_err(|e| e.into())
      })
      .await?;
    Ok(affected)
  }

  async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, anyhow::Error> {
    let now_s = encode_ts(now);
    let affected = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "DELETE FROM caches WHERE expire_time IS NOT NULL AND expire_time < ?1",
            params![now_s],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(affected)
  }

  async fn update_value_if(
    &self,
    key: &str,
    expected: Option<&[u8]>,
    value: &[u8],
  ) -> Result<bool, anyhow::Error> {
    let key = key.to_string();
    let value = value.to_vec();
    let expected = expected.map(|v| v.to_vec());
    let affected = self
      .conn
      .call(move |conn| {
        match expected {
          Some(expected) => conn.execute(
            "UPDATE caches SET cache_value = ?1 WHERE cache_key = ?2 AND cache_value = ?3",
            params![value, key, expected],
          ),
          None => conn.execute(
            "UPDATE caches SET cache_value = ?1 WHERE cache_key = ?2",
            params![value, key],
          ),
        }
        .map_err(|e| e.into())
      })
      .await?;
    Ok(affected > 0)
  }

  async fn update_expiry(
    &self,
    key: &str,
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<bool, anyhow::Error> {
    let key = key.to_string();
    let expire_s = expire_at.map(encode_ts);
    let affected = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "UPDATE caches SET expire_time = ?1 WHERE cache_key = ?2",
            params![expire_s, key],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(affected > 0)
  }
}
