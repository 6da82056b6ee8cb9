//! External capability traits and their registry.
//!
//! The orchestrator never talks to the network directly. It calls four
//! kinds of capability, each an `async_trait` object held as `Arc<dyn …>`:
//!
//! | Trait | Purpose | Built-in adapter |
//! |-------|---------|------------------|
//! | [`SourceCapability`] | Fetch reference material for a topic | [`HttpSource`](crate::source_http::HttpSource) |
//! | [`GenerationCapability`] | Generate candidates, draft messages | [`ChatGenerator`](crate::generation::ChatGenerator) |
//! | [`EvidenceCapability`] | Build supporting evidence | [`ReferenceEvidenceBuilder`](crate::evidence::ReferenceEvidenceBuilder) |
//! | [`EmbeddingProvider`] | Embed text for vector memory | [`HashingEmbedder`], [`HttpEmbedder`](crate::embedding::HttpEmbedder) |
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │               Capabilities                │
//! │  ┌──────────────┐ ┌──────────┐ ┌────────┐ │
//! │  │SourceRegistry│ │Generation│ │Evidence│ │
//! │  │ http / custom│ │  chat    │ │  refs  │ │
//! │  └──────────────┘ └──────────┘ └────────┘ │
//! │              ┌──────────┐                 │
//! │              │ Embedder │                 │
//! │              └──────────┘                 │
//! └─────────────────────┬─────────────────────┘
//!                       ▼
//!                 Orchestrator
//! ```
//!
//! Custom capabilities are plain trait implementations:
//!
//! ```rust
//! use async_trait::async_trait;
//! use std::time::Duration;
//! use excuse_harness::capabilities::{SourceCapability, SourceRegistry};
//! use excuse_harness_core::models::SourceItem;
//! use excuse_harness_core::PipelineResult;
//!
//! struct Fixed;
//!
//! #[async_trait]
//! impl SourceCapability for Fixed {
//!     fn name(&self) -> &str { "fixed" }
//!     async fn fetch(&self, _topic: &str, _timeout: Duration) -> PipelineResult<Vec<SourceItem>> {
//!         Ok(vec![])
//!     }
//! }
//!
//! let mut sources = SourceRegistry::new();
//! sources.register(std::sync::Arc::new(Fixed));
//! assert_eq!(sources.len(), 1);
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use excuse_harness_core::embedding::{EmbeddingProvider, HashingEmbedder};
use excuse_harness_core::models::{
    CandidateExcuse, DraftedMessage, EvidenceBundle, ExcuseRequest, SourceItem,
};
use excuse_harness_core::{PipelineError, PipelineResult};

use crate::config::Config;

/// A provider of reference material (news items).
#[async_trait]
pub trait SourceCapability: Send + Sync {
    /// Unique source name, used in reports and as `SourceItem::origin`.
    fn name(&self) -> &str;

    /// Weight in `[0.0, 1.0]` used to break ties between near-duplicates.
    fn trust_weight(&self) -> f64 {
        1.0
    }

    /// Fetch items about `topic`. Implementations should respect `timeout`;
    /// the collector enforces it regardless.
    async fn fetch(&self, topic: &str, timeout: Duration) -> PipelineResult<Vec<SourceItem>>;
}

/// Everything the generation capability sees when producing candidates.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub request: ExcuseRequest,
    /// Filtered reference material, most relevant first.
    pub references: Vec<SourceItem>,
    pub max_candidates: usize,
}

#[async_trait]
pub trait GenerationCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, context: &GenerationContext) -> PipelineResult<Vec<CandidateExcuse>>;

    /// Draft the outgoing message for the selected excuse. `notes` carries
    /// reviewer feedback on a redraft.
    async fn draft(
        &self,
        request: &ExcuseRequest,
        excuse: &CandidateExcuse,
        evidence: &EvidenceBundle,
        notes: Option<&str>,
    ) -> PipelineResult<DraftedMessage>;
}

#[async_trait]
pub trait EvidenceCapability: Send + Sync {
    async fn build(&self, excuse: &CandidateExcuse) -> PipelineResult<EvidenceBundle>;
}

/// Generation stand-in used when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

fn disabled() -> PipelineError {
    PipelineError::CapabilityDisabled {
        capability: "generation".to_string(),
        reason: "generation provider is disabled".to_string(),
    }
}

#[async_trait]
impl GenerationCapability for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _context: &GenerationContext) -> PipelineResult<Vec<CandidateExcuse>> {
        Err(disabled())
    }

    async fn draft(
        &self,
        _request: &ExcuseRequest,
        _excuse: &CandidateExcuse,
        _evidence: &EvidenceBundle,
        _notes: Option<&str>,
    ) -> PipelineResult<DraftedMessage> {
        Err(disabled())
    }
}

/// Ordered set of reference-material sources.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn SourceCapability>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Build an [`HttpSource`](crate::source_http::HttpSource) for every
    /// enabled `[sources.<name>]` entry, in name order.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, source) in &config.sources {
            if !source.enabled {
                continue;
            }
            registry.register(Arc::new(crate::source_http::HttpSource::new(name, source)?));
        }
        Ok(registry)
    }

    /// Add a source. A source with the same name replaces the earlier one.
    pub fn register(&mut self, source: Arc<dyn SourceCapability>) {
        self.sources.retain(|s| s.name() != source.name());
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn SourceCapability>] {
        &self.sources
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn SourceCapability>> {
        self.sources.iter().find(|s| s.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// All capabilities an orchestrator needs.
pub struct Capabilities {
    pub sources: SourceRegistry,
    pub generation: Arc<dyn GenerationCapability>,
    pub evidence: Arc<dyn EvidenceCapability>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

impl Capabilities {
    /// Wire up the built-in adapters from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let generation: Arc<dyn GenerationCapability> = if config.generation.is_enabled() {
            Arc::new(crate::generation::ChatGenerator::new(&config.generation)?)
        } else {
            Arc::new(DisabledGenerator)
        };
        Ok(Self {
            sources: SourceRegistry::from_config(config)?,
            generation,
            evidence: Arc::new(crate::evidence::ReferenceEvidenceBuilder::new()),
            embedder: crate::embedding::create_provider(&config.embedding)?,
        })
    }

    /// Offline defaults: no sources, generation disabled, hashing embedder.
    pub fn offline(dims: usize) -> Self {
        Self {
            sources: SourceRegistry::new(),
            generation: Arc::new(DisabledGenerator),
            evidence: Arc::new(crate::evidence::ReferenceEvidenceBuilder::new()),
            embedder: Arc::new(HashingEmbedder::new(dims)),
        }
    }
}
