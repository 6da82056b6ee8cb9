//! SQLite-backed [`CacheBackend`].
//!
//! One row per `(fingerprint, category)` in `cache_entries`. Payloads are
//! stored as JSON text and timestamps as Unix milliseconds. Every database
//! error surfaces as `CacheUnavailable`, which the cache layer treats as a
//! signal to degrade rather than fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use excuse_harness_core::cache::{CacheBackend, CacheEntry, CacheKey};
use excuse_harness_core::models::CacheCategory;
use excuse_harness_core::{Fingerprint, PipelineError, PipelineResult};

pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::cache_unavailable(e)
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<CacheEntry> {
    let fp: String = row.get("fingerprint");
    let category: String = row.get("category");
    let payload: String = row.get("payload");
    let fingerprint = Fingerprint::parse(&fp)
        .ok_or_else(|| unavailable(format!("corrupt fingerprint '{}'", fp)))?;
    let category = CacheCategory::parse(&category)
        .ok_or_else(|| unavailable(format!("unknown cache category '{}'", category)))?;
    Ok(CacheEntry {
        key: CacheKey::new(fingerprint, category),
        payload: serde_json::from_str(&payload).map_err(unavailable)?,
        created_at: from_millis(row.get("created_at")),
        expires_at: from_millis(row.get("expires_at")),
    })
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn load(&self, key: &CacheKey) -> PipelineResult<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT fingerprint, category, payload, created_at, expires_at
            FROM cache_entries
            WHERE fingerprint = ? AND category = ?
            "#,
        )
        .bind(key.fingerprint.as_str())
        .bind(key.category.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn store(&self, entry: CacheEntry) -> PipelineResult<()> {
        let payload = serde_json::to_string(&entry.payload).map_err(unavailable)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (fingerprint, category, payload, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint, category) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(entry.key.fingerprint.as_str())
        .bind(entry.key.category.as_str())
        .bind(&payload)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ? AND category = ?")
            .bind(key.fingerprint.as_str())
            .bind(key.category.as_str())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_fingerprint(&self, fingerprint: &Fingerprint) -> PipelineResult<usize> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() as usize)
    }

    async fn len(&self) -> PipelineResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(count as usize)
    }
}
