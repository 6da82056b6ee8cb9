//! Fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use excuse_harness::cache::{CacheLayer, TtlPolicy};
use excuse_harness::capabilities::{
    Capabilities, EvidenceCapability, GenerationCapability, GenerationContext, SourceCapability,
    SourceRegistry,
};
use excuse_harness::retry::{Backoff, RetryPolicy};
use excuse_harness::{Orchestrator, PipelineSettings, RunSnapshot};
use excuse_harness_core::cache::InMemoryCacheBackend;
use excuse_harness_core::embedding::HashingEmbedder;
use excuse_harness_core::memory::{InMemoryVectorMemory, VectorMemory};
use excuse_harness_core::models::{
    CandidateExcuse, DraftedMessage, Evidence, EvidenceBundle, EvidenceKind, ExcuseRequest,
    Novelty, RiskLevel, SourceItem,
};
use excuse_harness_core::{ErrorKind, PipelineError, PipelineResult};

pub const DIMS: usize = 64;

// ─── Sources ────────────────────────────────────────────────────────

pub struct ScriptedSource {
    pub name: String,
    pub delay: Duration,
    pub result: PipelineResult<Vec<SourceItem>>,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn ok(name: &str, delay_ms: u64, titles: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay: Duration::from_millis(delay_ms),
            result: Ok(titles.iter().map(|t| item(name, t, 0.6)).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &str, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay: Duration::from_millis(delay_ms),
            result: Err(PipelineError::SourceError {
                source_name: name.to_string(),
                reason: "upstream returned 502".to_string(),
            }),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SourceCapability for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _topic: &str, _timeout: Duration) -> PipelineResult<Vec<SourceItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

pub fn item(origin: &str, title: &str, relevance: f64) -> SourceItem {
    SourceItem {
        origin: origin.to_string(),
        title: title.to_string(),
        body: format!("{} according to witnesses", title),
        url: Some(format!("https://news.test/{}", title.replace(' ', "-"))),
        published_at: Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap(),
        relevance,
    }
}

// ─── Generation ─────────────────────────────────────────────────────

pub struct FakeGenerator {
    pub count: usize,
    pub delay: Duration,
    /// Errors returned by the first calls to `generate`, in order.
    pub failures: Mutex<Vec<PipelineError>>,
    pub calls: AtomicUsize,
    pub draft_calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn new(count: usize) -> Arc<Self> {
        Self::build(count, Duration::ZERO, Vec::new())
    }

    pub fn slow(count: usize, delay_ms: u64) -> Arc<Self> {
        Self::build(count, Duration::from_millis(delay_ms), Vec::new())
    }

    pub fn failing_first(count: usize, failures: Vec<PipelineError>) -> Arc<Self> {
        Self::build(count, Duration::ZERO, failures)
    }

    fn build(count: usize, delay: Duration, failures: Vec<PipelineError>) -> Arc<Self> {
        Arc::new(Self {
            count,
            delay,
            failures: Mutex::new(failures),
            calls: AtomicUsize::new(0),
            draft_calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn candidate_text(i: usize, situation: &str) -> String {
    let reasons = [
        "a flock of geese stopped traffic on the ring road",
        "the office lift was stuck between floors for an hour",
        "a burst water main flooded the tram depot",
        "a runaway llama closed the high street",
        "the power cut reset every alarm clock in the district",
    ];
    format!("Sorry about {}: {}", situation, reasons[i % reasons.len()])
}

#[async_trait]
impl GenerationCapability for FakeGenerator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, context: &GenerationContext) -> PipelineResult<Vec<CandidateExcuse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        Ok((0..self.count)
            .map(|i| CandidateExcuse {
                id: format!("cand-{}", i + 1),
                text: candidate_text(i, &context.request.situation),
                plausibility: 0.8,
                creativity: 0.6,
                risk: RiskLevel::Low,
                explanation: "Widely reported this morning".to_string(),
                news_reference: context.references.get(i).cloned(),
                novelty: Novelty::Unchecked,
            })
            .collect())
    }

    async fn draft(
        &self,
        request: &ExcuseRequest,
        excuse: &CandidateExcuse,
        _evidence: &EvidenceBundle,
        notes: Option<&str>,
    ) -> PipelineResult<DraftedMessage> {
        self.draft_calls.fetch_add(1, Ordering::SeqCst);
        let mut body = format!("Hi, {}", excuse.text);
        if let Some(notes) = notes {
            body.push_str(&format!(" (revised: {})", notes));
        }
        Ok(DraftedMessage {
            excuse_id: excuse.id.clone(),
            recipient_type: request.recipient.clone().unwrap_or_else(|| "manager".into()),
            tone: request.tone,
            subject: Some("Running late".to_string()),
            body,
            alternatives: Vec::new(),
        })
    }
}

// ─── Evidence ───────────────────────────────────────────────────────

pub struct FakeEvidence {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeEvidence {
    pub fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::from_millis(delay_ms),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EvidenceCapability for FakeEvidence {
    async fn build(&self, excuse: &CandidateExcuse) -> PipelineResult<EvidenceBundle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(EvidenceBundle {
            excuse_id: excuse.id.clone(),
            items: vec![Evidence {
                kind: EvidenceKind::Document,
                content: excuse.explanation.clone(),
                description: "Notes".to_string(),
                credibility: 0.7,
            }],
        })
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub memory: Arc<InMemoryVectorMemory>,
    pub cache: Arc<CacheLayer>,
    pub embedder: Arc<HashingEmbedder>,
}

pub fn fast_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.stage_timeout = Duration::from_secs(5);
    settings.retry = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::Fixed(Duration::from_millis(1)),
        retryable: vec![
            ErrorKind::RateLimited,
            ErrorKind::CapabilityUnavailable,
            ErrorKind::EvidenceUnavailable,
            ErrorKind::MemoryUnavailable,
        ],
    };
    settings
}

pub fn harness(
    sources: Vec<Arc<dyn SourceCapability>>,
    generation: Arc<dyn GenerationCapability>,
    evidence: Arc<dyn EvidenceCapability>,
    settings: PipelineSettings,
) -> Harness {
    let memory = Arc::new(InMemoryVectorMemory::new());
    harness_with_memory(sources, generation, evidence, settings, memory.clone(), memory)
}

pub fn harness_with_memory(
    sources: Vec<Arc<dyn SourceCapability>>,
    generation: Arc<dyn GenerationCapability>,
    evidence: Arc<dyn EvidenceCapability>,
    settings: PipelineSettings,
    memory: Arc<InMemoryVectorMemory>,
    store: Arc<dyn VectorMemory>,
) -> Harness {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    let embedder = Arc::new(HashingEmbedder::new(DIMS));
    let cache = Arc::new(CacheLayer::new(
        Arc::new(InMemoryCacheBackend::new()),
        TtlPolicy::default(),
    ));
    let capabilities = Capabilities {
        sources: registry,
        generation,
        evidence,
        embedder: embedder.clone(),
    };
    let orchestrator = Orchestrator::new(settings, cache.clone(), store, capabilities);
    Harness {
        orchestrator,
        memory,
        cache,
        embedder,
    }
}

/// Wait (bounded) until the run needs input or has finished.
pub async fn idle(orchestrator: &Orchestrator, run_id: &str) -> RunSnapshot {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_until_idle(run_id))
        .await
        .expect("run did not settle in time")
        .unwrap()
}

pub async fn until<P>(orchestrator: &Orchestrator, run_id: &str, predicate: P) -> RunSnapshot
where
    P: FnMut(&RunSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for(run_id, predicate))
        .await
        .expect("run did not reach the expected state in time")
        .unwrap()
}

pub fn two_sources() -> Vec<Arc<dyn SourceCapability>> {
    vec![
        ScriptedSource::ok("wire", 5, &["Geese halt ring road traffic", "Tram depot flooded"]),
        ScriptedSource::ok("local", 10, &["Llama parade closes high street"]),
    ]
}
