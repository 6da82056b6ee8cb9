//! Vector memory abstraction.
//!
//! The [`VectorMemory`] trait is the similarity-searchable record of past
//! artifacts. It serves two purposes: novelty filtering of freshly generated
//! candidates, and retrieval of similar past artifacts for callers.
//!
//! Memory is append-only. A correction is a new record plus a
//! `superseded_by` pointer on the old one (see [`VectorMemory::supersede`]).
//! Superseded records are excluded from queries unless the filter asks for
//! them.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`insert`](VectorMemory::insert) | Append a record, returning its new id |
//! | [`query_nearest`](VectorMemory::query_nearest) | Top-k cosine similarity search |
//! | [`novelty`](VectorMemory::novelty) | Classify a vector as novel or repetitive |
//! | [`supersede`](VectorMemory::supersede) | Correction insert |
//! | [`get`](VectorMemory::get) | Fetch one record by id |
//! | [`records`](VectorMemory::records) | List records matching a filter |
//! | [`restore`](VectorMemory::restore) | Re-insert an exported record verbatim |
//!
//! Implementations must be `Send + Sync`. Storage failures surface as
//! [`PipelineError::MemoryUnavailable`].

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ArtifactCategory, Novelty};

pub use in_memory::InMemoryVectorMemory;

/// Metadata stored alongside every vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub fingerprint: String,
    pub category: ArtifactCategory,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub superseded_by: Option<String>,
}

impl RecordMetadata {
    pub fn new(fingerprint: impl Into<String>, category: ArtifactCategory) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            category,
            created_at: Utc::now(),
            superseded_by: None,
        }
    }
}

/// One stored vector with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
    pub metadata: RecordMetadata,
}

/// Restricts which records a query considers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default)]
    pub category: Option<ArtifactCategory>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_superseded: bool,
}

impl MemoryFilter {
    pub fn category(category: ArtifactCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    pub fn with_superseded(mut self) -> Self {
        self.include_superseded = true;
        self
    }

    pub fn matches(&self, meta: &RecordMetadata) -> bool {
        if !self.include_superseded && meta.superseded_by.is_some() {
            return false;
        }
        if let Some(cat) = self.category {
            if meta.category != cat {
                return false;
            }
        }
        if let Some(fp) = &self.fingerprint {
            if &meta.fingerprint != fp {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if meta.created_at <= after {
                return false;
            }
        }
        true
    }
}

/// A query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub payload: serde_json::Value,
    pub similarity: f32,
    pub metadata: RecordMetadata,
}

/// Sort hits by similarity (non-increasing), oldest first on ties, and keep `k`.
pub fn rank_hits(mut hits: Vec<MemoryHit>, k: usize) -> Vec<MemoryHit> {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.metadata.created_at.cmp(&b.metadata.created_at))
    });
    hits.truncate(k);
    hits
}

/// Reject empty or non-finite vectors.
pub fn check_vector(vector: &[f32]) -> PipelineResult<()> {
    if vector.is_empty() {
        return Err(PipelineError::invalid_request("embedding vector is empty"));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(PipelineError::invalid_request(
            "embedding vector contains non-finite values",
        ));
    }
    Ok(())
}

/// Similarity-searchable store of past artifacts.
#[async_trait]
pub trait VectorMemory: Send + Sync {
    /// Append a record. The id is a fresh UUID v4; `metadata.superseded_by`
    /// is ignored. The record is visible to queries once this returns.
    async fn insert(
        &self,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String>;

    /// Up to `k` records matching `filter`, by cosine similarity.
    ///
    /// Records whose dimensionality differs from `vector` score `0.0`.
    async fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MemoryFilter,
    ) -> PipelineResult<Vec<MemoryHit>>;

    /// Insert a correction for `old_id` and mark the old record superseded.
    ///
    /// Fails with `InvalidRequest` if `old_id` is unknown and
    /// `InvalidState` if it was already superseded.
    async fn supersede(
        &self,
        old_id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String>;

    async fn get(&self, id: &str) -> PipelineResult<Option<EmbeddingRecord>>;

    /// All records matching `filter`, oldest first.
    async fn records(&self, filter: &MemoryFilter) -> PipelineResult<Vec<EmbeddingRecord>>;

    /// Store an existing record as-is, keeping its id. Existing ids are
    /// left untouched and reported as `false`.
    async fn restore(&self, record: EmbeddingRecord) -> PipelineResult<bool>;

    async fn len(&self) -> PipelineResult<usize>;

    async fn is_empty(&self) -> PipelineResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Classify `vector` against every current (non-superseded) record in
    /// `category`.
    async fn novelty(
        &self,
        vector: &[f32],
        category: ArtifactCategory,
        threshold: f32,
    ) -> PipelineResult<Novelty> {
        let hits = self
            .query_nearest(vector, 1, &MemoryFilter::category(category))
            .await?;
        Ok(match hits.first() {
            Some(hit) if hit.similarity >= threshold => Novelty::Repetitive {
                similarity: hit.similarity,
            },
            _ => Novelty::Novel,
        })
    }

    /// `false` if any current record in `category` scores at or above
    /// `threshold`.
    async fn is_novel(
        &self,
        vector: &[f32],
        category: ArtifactCategory,
        threshold: f32,
    ) -> PipelineResult<bool> {
        Ok(matches!(
            self.novelty(vector, category, threshold).await?,
            Novelty::Novel
        ))
    }
}
