//! SQLite-backed [`VectorMemory`].
//!
//! Records live in `memory_records` with the vector stored as a
//! little-endian f32 BLOB. Search is brute-force cosine similarity over
//! every row that passes the filter, which is fine for the thousands of
//! artifacts a single deployment accumulates.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use excuse_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use excuse_harness_core::memory::{
    check_vector, rank_hits, EmbeddingRecord, MemoryFilter, MemoryHit, RecordMetadata, VectorMemory,
};
use excuse_harness_core::models::ArtifactCategory;
use excuse_harness_core::{PipelineError, PipelineResult};

use crate::sqlite_cache::from_millis;

pub struct SqliteVectorMemory {
    pool: SqlitePool,
}

impl SqliteVectorMemory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::memory_unavailable(e)
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<EmbeddingRecord> {
    let blob: Vec<u8> = row.get("vector");
    let payload: String = row.get("payload");
    let category: String = row.get("category");
    Ok(EmbeddingRecord {
        id: row.get("id"),
        vector: blob_to_vec(&blob),
        payload: serde_json::from_str(&payload).map_err(unavailable)?,
        metadata: RecordMetadata {
            fingerprint: row.get("fingerprint"),
            category: ArtifactCategory::parse(&category)
                .ok_or_else(|| unavailable(format!("unknown artifact category '{}'", category)))?,
            created_at: from_millis(row.get("created_at")),
            superseded_by: row.get("superseded_by"),
        },
    })
}

/// `SELECT ... FROM memory_records WHERE <filter>`.
fn filtered_select(filter: &MemoryFilter) -> QueryBuilder<'_, Sqlite> {
    let mut qb = QueryBuilder::new(
        "SELECT id, vector, payload, fingerprint, category, created_at, superseded_by \
         FROM memory_records WHERE 1 = 1",
    );
    if !filter.include_superseded {
        qb.push(" AND superseded_by IS NULL");
    }
    if let Some(cat) = filter.category {
        qb.push(" AND category = ").push_bind(cat.as_str());
    }
    if let Some(fp) = &filter.fingerprint {
        qb.push(" AND fingerprint = ").push_bind(fp.as_str());
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created_at > ")
            .push_bind(after.timestamp_millis());
    }
    qb.push(" ORDER BY created_at ASC, rowid ASC");
    qb
}

async fn insert_row<'e, E>(executor: E, record: &EmbeddingRecord) -> PipelineResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&record.payload).map_err(unavailable)?;
    sqlx::query(
        r#"
        INSERT INTO memory_records (id, vector, dims, payload, fingerprint, category,
                                    created_at, superseded_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(vec_to_blob(&record.vector))
    .bind(record.vector.len() as i64)
    .bind(&payload)
    .bind(&record.metadata.fingerprint)
    .bind(record.metadata.category.as_str())
    .bind(record.metadata.created_at.timestamp_millis())
    .bind(&record.metadata.superseded_by)
    .execute(executor)
    .await
    .map_err(unavailable)?;
    Ok(())
}

fn fresh_record(
    vector: Vec<f32>,
    payload: serde_json::Value,
    mut metadata: RecordMetadata,
) -> EmbeddingRecord {
    metadata.superseded_by = None;
    EmbeddingRecord {
        id: uuid::Uuid::new_v4().to_string(),
        vector,
        payload,
        metadata,
    }
}

#[async_trait]
impl VectorMemory for SqliteVectorMemory {
    async fn insert(
        &self,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        check_vector(&vector)?;
        let record = fresh_record(vector, payload, metadata);
        insert_row(&self.pool, &record).await?;
        Ok(record.id)
    }

    async fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MemoryFilter,
    ) -> PipelineResult<Vec<MemoryHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut qb = filtered_select(filter);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            hits.push(MemoryHit {
                similarity: cosine_similarity(vector, &record.vector),
                id: record.id,
                payload: record.payload,
                metadata: record.metadata,
            });
        }
        Ok(rank_hits(hits, k))
    }

    async fn supersede(
        &self,
        old_id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        check_vector(&vector)?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let existing: Option<Option<String>> =
            sqlx::query_scalar("SELECT superseded_by FROM memory_records WHERE id = ?")
                .bind(old_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
        match existing {
            None => {
                return Err(PipelineError::invalid_request(format!(
                    "unknown record {}",
                    old_id
                )))
            }
            Some(Some(newer)) => {
                return Err(PipelineError::InvalidState {
                    reason: format!("record {} already superseded by {}", old_id, newer),
                })
            }
            Some(None) => {}
        }

        let record = fresh_record(vector, payload, metadata);
        insert_row(&mut *tx, &record).await?;
        sqlx::query("UPDATE memory_records SET superseded_by = ? WHERE id = ?")
            .bind(&record.id)
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        Ok(record.id)
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT id, vector, payload, fingerprint, category, created_at, superseded_by \
             FROM memory_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn records(&self, filter: &MemoryFilter) -> PipelineResult<Vec<EmbeddingRecord>> {
        let mut qb = filtered_select(filter);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn restore(&self, record: EmbeddingRecord) -> PipelineResult<bool> {
        check_vector(&record.vector)?;
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM memory_records WHERE id = ?")
                .bind(&record.id)
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)?;
        if exists {
            return Ok(false);
        }
        insert_row(&self.pool, &record).await?;
        Ok(true)
    }

    async fn len(&self) -> PipelineResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_records")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(count as usize)
    }
}
