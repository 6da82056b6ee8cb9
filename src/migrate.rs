//! Idempotent schema setup.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `cache_entries` | Cache Layer entries, one row per `(fingerprint, category)` |
//! | `memory_records` | Vector Memory records, vectors as little-endian f32 BLOBs |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Connect to the configured database and apply the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema on an existing pool. Safe to call repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create cache table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            fingerprint TEXT NOT NULL,
            category TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (fingerprint, category)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create vector memory table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_records (
            id TEXT PRIMARY KEY,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            payload TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            category TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            superseded_by TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache_entries(expires_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_category ON memory_records(category, superseded_by)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memory_fingerprint ON memory_records(fingerprint)")
        .execute(pool)
        .await?;

    Ok(())
}
