//! PostgreSQL row store backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use super::store::RowStore;
use crate::row::CacheRow;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    id BIGSERIAL PRIMARY KEY,
    cache_key VARCHAR(255) NOT NULL UNIQUE,
    cache_value BYTEA NOT NULL,
    expire_time TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_caches_cache_key ON caches(cache_key);
CREATE INDEX IF NOT EXISTS idx_caches_expire_time ON caches(expire_time);
"#;

const ROW_COLUMNS: &str = "id, cache_key, cache_value, expire_time, created_at";

fn row_from_pg(r: &tokio_postgres::Row) -> CacheRow {
  CacheRow {
    id: r.get(0),
    key: r.get(1),
    value: r.get(2),
    expire_at: r.get(3),
    created_at: r.get(4),
  }
}

/// Row store backed by a PostgreSQL connection pool
pub struct PostgresRowStore {
  pool: Pool,
}

impl PostgresRowStore {
  pub fn new(url: &str) -> Result<Self, anyhow::Error> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    Ok(Self { pool })
  }
}

#[async_trait]
impl RowStore for PostgresRowStore {
  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self.pool.get().await?.batch_execute(SCHEMA).await?;
    tracing::info!("PostgreSQL caches schema initialized");
    Ok(())
  }

  async fn find_live(
    &self,
    key: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<CacheRow>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!(
          "SELECT {} FROM caches WHERE cache_key = $1 \
           AND (expire_time IS NULL OR expire_time > $2)",
          ROW_COLUMNS
        ),
        &[&key, &now],
      )
      .await?;
    Ok(row.map(|r| row_from_pg(&r)))
  }

  async fn find(&self, key: &str) -> Result<Option<CacheRow>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!("SELECT {} FROM caches WHERE cache_key = $1", ROW_COLUMNS),
        &[&key],
      )
      .await?;
    Ok(row.map(|r| row_from_pg(&r)))
  }

  async fn find_many(&self, keys: &[String]) -> Result<Vec<CacheRow>, anyhow::Error> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let keys = keys.to_vec();
    let rows = self
      .pool
      .get()
      .await?
      .query(
        &format!(
          "SELECT {} FROM caches WHERE cache_key = ANY($1)",
          ROW_COLUMNS
        ),
        &[&keys],
      )
      .await?;
    Ok(rows.iter().map(row_from_pg).collect())
  }

  async fn upsert(
    &self,
    key: &str,
    value: &[u8],
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<(), anyhow::Error> {
    let now = Utc::now();
    self
      .pool
      .get()
      .await?
      .execute(
        "INSERT INTO caches (cache_key, cache_value, expire_time, created_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (cache_key) DO UPDATE SET \
         cache_value = EXCLUDED.cache_value, expire_time = EXCLUDED.expire_time",
        &[&key, &value, &expire_at, &now],
      )
      .await?;
    Ok(())
  }

  async fn insert(
    &self,
    key: &str,
    value: &[u8],
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<(), anyhow::Error> {
    let now = Utc::now();
    self
      .pool
      .get()
      .await?
      .execute(
        "INSERT INTO caches (cache_key, cache_value, expire_time, created_at) \
         VALUES ($1, $2, $3, $4)",
        &[&key, &value, &expire_at, &now],
      )
      .await?;
    Ok(())
  }

  async fn delete(&self, keys: &[String]) -> Result<usize, anyhow::Error> {
    if keys.is_empty() {
      return Ok(0);
    }
    let keys = keys.to_vec();
    let affected = self
      .pool
      .get()
      .await?
      .execute("DELETE FROM caches WHERE cache_key = ANY($1)", &[&keys])
      .await?;
    Ok(affected as usize)
  }

  async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, anyhow::Error> {
    let affected = self
      .pool
      .get()
      .await?
      .execute(
        "DELETE FROM caches WHERE expire_time IS NOT NULL AND expire_time < $1",
        &[&now],
      )
      .await?;
    Ok(affected as usize)
  }

  async fn update_value_if(
    &self,
    key: &str,
    expected: Option<&[u8]>,
    value: &[u8],
  ) -> Result<bool, anyhow::Error> {
    let client = self.pool.get().await?;
    let affected = match expected {
      Some(expected) => {
        client
          .execute(
            "UPDATE caches SET cache_value = $1 \
             WHERE cache_key = $2 AND cache_value = $3",
            &[&value, &key, &expected],
          )
          .await?
      }
      None => {
        client
          .execute(
            "UPDATE caches SET cache_value = $1 WHERE cache_key = $2",
            &[&value, &key],
          )
          .await?
      }
    };
    Ok(affected > 0)
  }

  async fn update_expiry(
    &self,
    key: &str,
    expire_at: Option<DateTime<Utc>>,
  ) -> Result<bool, anyhow::Error> {
    let affected = self
      .pool
      .get()
      .await?
      .execute(
        "UPDATE caches SET expire_time = $1 WHERE cache_key = $2",
        &[&expire_at, &key],
      )
      .await?;
    Ok(affected > 0)
  }
}
