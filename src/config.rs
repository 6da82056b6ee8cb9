//! Configuration parsing and validation.
//!
//! Excuse Harness is configured via a TOML file (default:
//! `config/exh.toml`). Every section except `[db]` is optional and falls
//! back to the defaults below.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/exh.sqlite"
//!
//! [cache]
//! backend = "sqlite"
//! raw_material_ttl_secs = 3600
//!
//! [collection]
//! per_source_timeout_ms = 5000
//! minimum_quorum = 1
//!
//! [memory]
//! novelty_threshold = 0.92
//! novelty_policy = "drop"
//!
//! [embedding]
//! provider = "hashing"
//! dims = 256
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.2:3b"
//!
//! [pipeline]
//! max_concurrent_runs = 4
//! run_retention_secs = 3600
//!
//! [pipeline.retry]
//! max_attempts = 3
//! backoff = "exponential"
//!
//! [server]
//! bind = "127.0.0.1:7433"
//!
//! [sources.wire]
//! url = "http://localhost:8080/news"
//! trust_weight = 0.8
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use excuse_harness_core::models::CacheCategory;
use excuse_harness_core::ErrorKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Named reference-material sources, keyed by source name.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where cache entries and memory records live.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_raw_ttl")]
    pub raw_material_ttl_secs: u64,
    #[serde(default = "default_generated_ttl")]
    pub generated_text_ttl_secs: u64,
    #[serde(default = "default_evidence_ttl")]
    pub evidence_asset_ttl_secs: u64,
    /// Interval of the background expiry sweep under `exh serve`. `0` disables it.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            raw_material_ttl_secs: default_raw_ttl(),
            generated_text_ttl_secs: default_generated_ttl(),
            evidence_asset_ttl_secs: default_evidence_ttl(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_secs(&self, category: CacheCategory) -> u64 {
        match category {
            CacheCategory::RawMaterial => self.raw_material_ttl_secs,
            CacheCategory::GeneratedText => self.generated_text_ttl_secs,
            CacheCategory::EvidenceAsset => self.evidence_asset_ttl_secs,
        }
    }
}

fn default_raw_ttl() -> u64 {
    3600
}
fn default_generated_ttl() -> u64 {
    24 * 3600
}
fn default_evidence_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_purge_interval() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_source_timeout_ms")]
    pub per_source_timeout_ms: u64,
    #[serde(default = "default_quorum")]
    pub minimum_quorum: usize,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,
    #[serde(default = "default_max_reference_items")]
    pub max_reference_items: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            per_source_timeout_ms: default_source_timeout_ms(),
            minimum_quorum: default_quorum(),
            dedup_threshold: default_dedup_threshold(),
            relevance_floor: default_relevance_floor(),
            max_reference_items: default_max_reference_items(),
        }
    }
}

impl CollectionConfig {
    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_millis(self.per_source_timeout_ms)
    }
}

fn default_source_timeout_ms() -> u64 {
    5000
}
fn default_quorum() -> usize {
    1
}
fn default_dedup_threshold() -> f64 {
    0.85
}
fn default_relevance_floor() -> f64 {
    0.2
}
fn default_max_reference_items() -> usize {
    8
}

/// What to do with generated candidates that repeat past artifacts.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoveltyPolicy {
    /// Remove repetitive candidates.
    #[default]
    Drop,
    /// Keep them, marked `Repetitive`.
    Flag,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_novelty_threshold")]
    pub novelty_threshold: f32,
    #[serde(default)]
    pub novelty_policy: NoveltyPolicy,
    #[serde(default = "default_similar_limit")]
    pub similar_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            novelty_threshold: default_novelty_threshold(),
            novelty_policy: NoveltyPolicy::default(),
            similar_limit: default_similar_limit(),
        }
    }
}

fn default_novelty_threshold() -> f32 {
    0.92
}
fn default_similar_limit() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_candidates: default_max_candidates(),
            min_candidates: default_min_candidates(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_max_candidates() -> usize {
    5
}
fn default_min_candidates() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// How long a finished run stays queryable before it is dropped.
    #[serde(default = "default_run_retention_secs")]
    pub run_retention_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            stage_timeout_secs: default_stage_timeout_secs(),
            run_retention_secs: default_run_retention_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }
}

fn default_max_concurrent_runs() -> usize {
    4
}
fn default_stage_timeout_secs() -> u64 {
    120
}
fn default_run_retention_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            base_ms: default_base_ms(),
            factor: default_factor(),
            cap_ms: default_cap_ms(),
            retryable: default_retryable(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_ms() -> u64 {
    1000
}
fn default_factor() -> f64 {
    2.0
}
fn default_cap_ms() -> u64 {
    32_000
}
fn default_retryable() -> Vec<ErrorKind> {
    vec![
        ErrorKind::RateLimited,
        ErrorKind::CapabilityUnavailable,
        ErrorKind::EvidenceUnavailable,
        ErrorKind::MemoryUnavailable,
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7433".to_string()
}

/// One JSON news feed endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
    /// Query parameter carrying the topic.
    #[serde(default = "default_query_param")]
    pub query_param: String,
    /// Environment variable holding a bearer token, if the feed needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_trust_weight() -> f64 {
    1.0
}
fn default_query_param() -> String {
    "q".to_string()
}
fn default_true() -> bool {
    true
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, secs) in [
        ("cache.raw_material_ttl_secs", config.cache.raw_material_ttl_secs),
        ("cache.generated_text_ttl_secs", config.cache.generated_text_ttl_secs),
        ("cache.evidence_asset_ttl_secs", config.cache.evidence_asset_ttl_secs),
    ] {
        if secs == 0 {
            anyhow::bail!("{} must be > 0", name);
        }
    }

    // Validate collection
    let c = &config.collection;
    if c.per_source_timeout_ms == 0 {
        anyhow::bail!("collection.per_source_timeout_ms must be > 0");
    }
    if c.minimum_quorum == 0 {
        anyhow::bail!("collection.minimum_quorum must be >= 1");
    }
    if !(0.0..=1.0).contains(&c.dedup_threshold) || c.dedup_threshold == 0.0 {
        anyhow::bail!("collection.dedup_threshold must be in (0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&c.relevance_floor) {
        anyhow::bail!("collection.relevance_floor must be in [0.0, 1.0]");
    }
    if c.max_reference_items == 0 {
        anyhow::bail!("collection.max_reference_items must be >= 1");
    }

    // Validate memory
    if !(0.0..=1.0).contains(&config.memory.novelty_threshold) {
        anyhow::bail!("memory.novelty_threshold must be in [0.0, 1.0]");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hashing" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, or ollama.",
            other
        ),
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.max_candidates == 0 {
        anyhow::bail!("generation.max_candidates must be >= 1");
    }
    if config.generation.min_candidates > config.generation.max_candidates {
        anyhow::bail!("generation.min_candidates must be <= generation.max_candidates");
    }

    // Validate pipeline
    if config.pipeline.max_concurrent_runs == 0 {
        anyhow::bail!("pipeline.max_concurrent_runs must be >= 1");
    }
    if config.pipeline.stage_timeout_secs == 0 {
        anyhow::bail!("pipeline.stage_timeout_secs must be > 0");
    }
    if config.pipeline.run_retention_secs == 0 {
        anyhow::bail!("pipeline.run_retention_secs must be > 0");
    }
    let r = &config.pipeline.retry;
    if r.max_attempts == 0 {
        anyhow::bail!("pipeline.retry.max_attempts must be >= 1");
    }
    if r.factor < 1.0 {
        anyhow::bail!("pipeline.retry.factor must be >= 1.0");
    }
    if r.cap_ms < r.base_ms {
        anyhow::bail!("pipeline.retry.cap_ms must be >= pipeline.retry.base_ms");
    }

    for (name, source) in &config.sources {
        if !(0.0..=1.0).contains(&source.trust_weight) {
            anyhow::bail!("sources.{}.trust_weight must be in [0.0, 1.0]", name);
        }
        if source.url.trim().is_empty() {
            anyhow::bail!("sources.{}.url must not be empty", name);
        }
    }

    Ok(())
}
