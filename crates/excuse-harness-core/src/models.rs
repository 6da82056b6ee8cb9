//! Core data models that flow through the excuse pipeline.
//!
//! Requests come in, [`SourceItem`]s are collected into a
//! [`CollectionResult`], the generation capability produces
//! [`CandidateExcuse`]s, and the selected one is turned into an
//! [`EvidenceBundle`], a [`DraftedMessage`], and finally a persisted
//! [`Artifact`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tone of the drafted communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Professional,
    Casual,
    Apologetic,
    Confident,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Professional => "professional",
            Tone::Casual => "casual",
            Tone::Apologetic => "apologetic",
            Tone::Confident => "confident",
        }
    }
}

/// Kind of news an excuse should be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsCategory {
    NationalFunny,
    NationalAbsurd,
    InternationalFunny,
    InternationalAbsurd,
}

impl NewsCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsCategory::NationalFunny => "national_funny",
            NewsCategory::NationalAbsurd => "national_absurd",
            NewsCategory::InternationalFunny => "international_funny",
            NewsCategory::InternationalAbsurd => "international_absurd",
        }
    }

    /// Search hint appended to the collection topic.
    pub fn search_hint(&self) -> &'static str {
        match self {
            NewsCategory::NationalFunny => "funny local news",
            NewsCategory::NationalAbsurd => "absurd local news",
            NewsCategory::InternationalFunny => "funny world news",
            NewsCategory::InternationalAbsurd => "absurd world news",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A caller's request for an excuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcuseRequest {
    /// The situation requiring an excuse (e.g. `"late to standup"`).
    pub situation: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub news_category: Option<NewsCategory>,
    /// Whether the evidence stage should build a bundle.
    #[serde(default = "default_true")]
    pub include_evidence: bool,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

impl ExcuseRequest {
    pub fn new(situation: impl Into<String>) -> Self {
        Self {
            situation: situation.into(),
            context: None,
            recipient: None,
            tone: Tone::default(),
            news_category: None,
            include_evidence: true,
            requested_at: Utc::now(),
        }
    }

    /// Free-text topic handed to reference-material sources.
    pub fn topic(&self) -> String {
        match self.news_category {
            Some(cat) => format!("{} {}", self.situation.trim(), cat.search_hint()),
            None => self.situation.trim().to_string(),
        }
    }
}

/// One unit of collected reference material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Name of the source that produced this item.
    pub origin: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
    /// Source-assigned relevance signal in `[0.0, 1.0]`.
    #[serde(default)]
    pub relevance: f64,
}

/// What happened to one source during a collection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded { items: usize },
    Failed { reason: String },
    TimedOut,
    /// Still pending when quorum was reached; results discarded.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub outcome: SourceOutcome,
    pub elapsed_ms: u64,
}

/// Deduplicated, ordered reference material plus per-source bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub items: Vec<SourceItem>,
    pub reports: Vec<SourceReport>,
    pub collected_at: DateTime<Utc>,
}

impl CollectionResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &SourceReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Succeeded { .. }))
    }
}

/// Freshness class of a cache entry. Each category has its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    /// Collected reference material (short TTL).
    RawMaterial,
    /// Generated candidates and drafts (medium TTL).
    GeneratedText,
    /// Built evidence assets (long TTL).
    EvidenceAsset,
}

impl CacheCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::RawMaterial => "raw_material",
            CacheCategory::GeneratedText => "generated_text",
            CacheCategory::EvidenceAsset => "evidence_asset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw_material" => Some(CacheCategory::RawMaterial),
            "generated_text" => Some(CacheCategory::GeneratedText),
            "evidence_asset" => Some(CacheCategory::EvidenceAsset),
            _ => None,
        }
    }
}

/// Kind of generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Excuse,
    Evidence,
    Message,
}

impl ArtifactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactCategory::Excuse => "excuse",
            ArtifactCategory::Evidence => "evidence",
            ArtifactCategory::Message => "message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excuse" => Some(ArtifactCategory::Excuse),
            "evidence" => Some(ArtifactCategory::Evidence),
            "message" => Some(ArtifactCategory::Message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Result of checking a candidate against past artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Novelty {
    Novel,
    Repetitive { similarity: f32 },
    /// Memory was unavailable; repetition avoidance skipped.
    #[default]
    Unchecked,
}

/// One generated excuse option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateExcuse {
    pub id: String,
    pub text: String,
    pub plausibility: f64,
    pub creativity: f64,
    pub risk: RiskLevel,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub news_reference: Option<SourceItem>,
    #[serde(default)]
    pub novelty: Novelty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Link,
    Document,
    Screenshot,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    /// URL or inline content.
    pub content: String,
    pub description: String,
    pub credibility: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub excuse_id: String,
    pub items: Vec<Evidence>,
}

impl EvidenceBundle {
    pub fn empty(excuse_id: impl Into<String>) -> Self {
        Self {
            excuse_id: excuse_id.into(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftedMessage {
    pub excuse_id: String,
    pub recipient_type: String,
    pub tone: Tone,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

/// A persisted output of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub fingerprint: String,
    pub category: ArtifactCategory,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub plausibility_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_from_json() {
        let req: ExcuseRequest =
            serde_json::from_str(r#"{"situation": "late to meeting"}"#).unwrap();
        assert_eq!(req.tone, Tone::Professional);
        assert!(req.include_evidence);
        assert!(req.context.is_none());
    }

    #[test]
    fn topic_includes_category_hint() {
        let mut req = ExcuseRequest::new("  missed the train ");
        assert_eq!(req.topic(), "missed the train");
        req.news_category = Some(NewsCategory::InternationalAbsurd);
        assert_eq!(req.topic(), "missed the train absurd world news");
    }

    #[test]
    fn category_parse_roundtrips_names() {
        for cat in [
            CacheCategory::RawMaterial,
            CacheCategory::GeneratedText,
            CacheCategory::EvidenceAsset,
        ] {
            assert_eq!(CacheCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(ArtifactCategory::parse("message"), Some(ArtifactCategory::Message));
        assert_eq!(ArtifactCategory::parse("bogus"), None);
    }
}
