//! In-memory [`VectorMemory`] implementation for tests and ephemeral runs.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`, in insertion order.
//! Search is brute-force cosine similarity over all stored vectors.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{PipelineError, PipelineResult};

use super::{
    check_vector, rank_hits, EmbeddingRecord, MemoryFilter, MemoryHit, RecordMetadata,
    VectorMemory,
};

pub struct InMemoryVectorMemory {
    records: RwLock<Vec<EmbeddingRecord>>,
}

impl InMemoryVectorMemory {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> PipelineResult<RwLockReadGuard<'_, Vec<EmbeddingRecord>>> {
        self.records
            .read()
            .map_err(|_| PipelineError::memory_unavailable("memory lock poisoned"))
    }

    fn write(&self) -> PipelineResult<RwLockWriteGuard<'_, Vec<EmbeddingRecord>>> {
        self.records
            .write()
            .map_err(|_| PipelineError::memory_unavailable("memory lock poisoned"))
    }
}

impl Default for InMemoryVectorMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn new_record(
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
impl VectorMemory for InMemoryVectorMemory {
    async fn insert(
        &self,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        check_vector(&vector)?;
        let record = new_record(vector, payload, metadata);
        let id = record.id.clone();
        self.write()?.push(record);
        Ok(id)
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
        let records = self.read()?;
        let hits = records
            .iter()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| MemoryHit {
                id: r.id.clone(),
                payload: r.payload.clone(),
                similarity: cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
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
        let mut records = self.write()?;
        let old = records
            .iter_mut()
            .find(|r| r.id == old_id)
            .ok_or_else(|| PipelineError::invalid_request(format!("unknown record {}", old_id)))?;
        if let Some(newer) = &old.metadata.superseded_by {
            return Err(PipelineError::InvalidState {
                reason: format!("record {} already superseded by {}", old_id, newer),
            });
        }
        let record = new_record(vector, payload, metadata);
        let id = record.id.clone();
        old.metadata.superseded_by = Some(id.clone());
        records.push(record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<EmbeddingRecord>> {
        Ok(self.read()?.iter().find(|r| r.id == id).cloned())
    }

    async fn records(&self, filter: &MemoryFilter) -> PipelineResult<Vec<EmbeddingRecord>> {
        Ok(self
            .read()?
            .iter()
            .filter(|r| filter.matches(&r.metadata))
            .cloned()
            .collect())
    }

    async fn restore(&self, record: EmbeddingRecord) -> PipelineResult<bool> {
        check_vector(&record.vector)?;
        let mut records = self.write()?;
        if records.iter().any(|r| r.id == record.id) {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    async fn len(&self) -> PipelineResult<usize> {
        Ok(self.read()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactCategory, Novelty};
    use serde_json::json;

    fn meta(cat: ArtifactCategory) -> RecordMetadata {
        RecordMetadata::new("fp", cat)
    }

    #[tokio::test]
    async fn insert_is_visible_to_next_query() {
        let mem = InMemoryVectorMemory::new();
        let id = mem
            .insert(vec![1.0, 0.0], json!({"text": "a"}), meta(ArtifactCategory::Excuse))
            .await
            .unwrap();
        let hits = mem
            .query_nearest(&[1.0, 0.0], 5, &MemoryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn results_are_ordered_and_bounded() {
        let mem = InMemoryVectorMemory::new();
        for v in [[1.0, 0.0], [0.7, 0.7], [0.0, 1.0], [0.9, 0.1]] {
            mem.insert(v.to_vec(), json!(null), meta(ArtifactCategory::Excuse))
                .await
                .unwrap();
        }
        let hits = mem
            .query_nearest(&[1.0, 0.0], 3, &MemoryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn dimension_mismatch_never_matches() {
        let mem = InMemoryVectorMemory::new();
        mem.insert(vec![1.0, 0.0, 0.0], json!(null), meta(ArtifactCategory::Excuse))
            .await
            .unwrap();
        let novelty = mem
            .novelty(&[1.0, 0.0], ArtifactCategory::Excuse, 0.5)
            .await
            .unwrap();
        assert_eq!(novelty, Novelty::Novel);
    }

    #[tokio::test]
    async fn novelty_threshold_and_category() {
        let mem = InMemoryVectorMemory::new();
        mem.insert(vec![1.0, 0.0], json!(null), meta(ArtifactCategory::Excuse))
            .await
            .unwrap();
        assert!(!mem
            .is_novel(&[1.0, 0.0], ArtifactCategory::Excuse, 0.9)
            .await
            .unwrap());
        assert!(mem
            .is_novel(&[1.0, 0.0], ArtifactCategory::Message, 0.9)
            .await
            .unwrap());
        assert!(mem
            .is_novel(&[0.0, 1.0], ArtifactCategory::Excuse, 0.9)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn supersede_hides_old_record() {
        let mem = InMemoryVectorMemory::new();
        let old = mem
            .insert(vec![1.0, 0.0], json!({"v": 1}), meta(ArtifactCategory::Excuse))
            .await
            .unwrap();
        let new = mem
            .supersede(&old, vec![1.0, 0.0], json!({"v": 2}), meta(ArtifactCategory::Excuse))
            .await
            .unwrap();

        let hits = mem
            .query_nearest(&[1.0, 0.0], 5, &MemoryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, new);

        let old_rec = mem.get(&old).await.unwrap().unwrap();
        assert_eq!(old_rec.metadata.superseded_by.as_deref(), Some(new.as_str()));
        assert_eq!(mem.len().await.unwrap(), 2);

        let again = mem
            .supersede(&old, vec![1.0, 0.0], json!(null), meta(ArtifactCategory::Excuse))
            .await
            .unwrap_err();
        assert_eq!(again.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn restore_keeps_id_and_skips_existing() {
        let mem = InMemoryVectorMemory::new();
        let record = EmbeddingRecord {
            id: "fixed-id".into(),
            vector: vec![0.5, 0.5],
            payload: json!({"text": "x"}),
            metadata: meta(ArtifactCategory::Message),
        };
        assert!(mem.restore(record.clone()).await.unwrap());
        assert!(!mem.restore(record).await.unwrap());
        assert!(mem.get("fixed-id").await.unwrap().is_some());
        assert_eq!(mem.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_vector_is_invalid() {
        let mem = InMemoryVectorMemory::new();
        let err = mem
            .insert(Vec::new(), json!(null), meta(ArtifactCategory::Excuse))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
        assert!(mem.is_empty().await.unwrap());
    }
}
