//! End-to-end orchestrator runs against fake capabilities.

mod common;

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use excuse_harness::capabilities::SourceCapability;
use excuse_harness::config::NoveltyPolicy;
use excuse_harness::{ReviewDecision, RunState};
use excuse_harness_core::cache::CacheKey;
use excuse_harness_core::memory::{
    EmbeddingRecord, InMemoryVectorMemory, MemoryFilter, MemoryHit, RecordMetadata, VectorMemory,
};
use excuse_harness_core::models::{
    ArtifactCategory, CacheCategory, ExcuseRequest, Novelty, SourceOutcome,
};
use excuse_harness_core::{ErrorKind, Fingerprint, PipelineError, PipelineResult};

use common::*;

fn request() -> ExcuseRequest {
    let mut req = ExcuseRequest::new("late to the quarterly review");
    req.recipient = Some("manager".into());
    req
}

fn artifact_key(fingerprint: &str) -> CacheKey {
    let fp = Fingerprint::parse(fingerprint).unwrap();
    CacheKey::new(fp.derive("artifact"), CacheCategory::GeneratedText)
}

fn evidence_key(fingerprint: &str, candidate: &str) -> CacheKey {
    let fp = Fingerprint::parse(fingerprint).unwrap();
    CacheKey::new(
        fp.derive(&format!("evidence:{}", candidate)),
        CacheCategory::EvidenceAsset,
    )
}

#[tokio::test]
async fn approved_run_is_persisted() {
    let generator = FakeGenerator::new(3);
    let evidence = FakeEvidence::new(0);
    let h = harness(two_sources(), generator.clone(), evidence.clone(), fast_settings());
    let orch = &h.orchestrator;

    let run_id = orch.start_run(request()).unwrap();
    let snap = idle(orch, &run_id).await;
    assert_eq!(snap.state, RunState::AwaitingSelection);
    assert_eq!(snap.candidates.len(), 3);
    assert!(snap.candidates.iter().all(|c| c.novelty == Novelty::Novel));
    assert!(!snap.references.is_empty());
    let collection = snap.collection.as_ref().unwrap();
    assert!(collection
        .reports
        .iter()
        .any(|r| matches!(r.outcome, SourceOutcome::Succeeded { .. })));

    orch.select_candidate(&run_id, "cand-2").unwrap();
    let snap = until(orch, &run_id, |s| {
        s.state == RunState::AwaitingReview || s.state.is_terminal()
    })
    .await;
    assert_eq!(snap.state, RunState::AwaitingReview);
    assert_eq!(snap.drafts, 1);
    assert_eq!(snap.selected.as_ref().unwrap().id, "cand-2");
    assert_eq!(snap.evidence.as_ref().unwrap().items.len(), 1);
    assert!(snap.message.as_ref().unwrap().body.contains("lift"));

    orch.submit_review(&run_id, ReviewDecision::Approve).unwrap();
    let snap = until(orch, &run_id, |s| s.state.is_terminal()).await;
    assert_eq!(snap.state, RunState::Completed);
    assert!(snap.degraded.is_empty(), "{:?}", snap.degraded);

    let artifact = snap.artifact.as_ref().unwrap();
    assert_eq!(artifact.fingerprint, snap.fingerprint);
    assert_eq!(artifact.payload["excuse"]["id"], "cand-2");
    assert_eq!(h.memory.len().await.unwrap(), 2);
    let cached = h.cache.peek(&artifact_key(&snap.fingerprint)).await.unwrap();
    assert_eq!(cached.unwrap()["id"], artifact.id.as_str());
    assert!(h
        .cache
        .peek(&evidence_key(&snap.fingerprint, "cand-2"))
        .await
        .unwrap()
        .is_some());

    let stages: Vec<&str> = snap.history.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            "collecting",
            "filtering",
            "generating",
            "awaiting_selection",
            "building_evidence",
            "drafting",
            "awaiting_review",
            "persisting",
            "completed"
        ]
    );
    assert_eq!(generator.draft_calls.load(Ordering::SeqCst), 1);
    assert_eq!(evidence.calls.load(Ordering::SeqCst), 1);

    // The stored excuse now makes the same candidates repetitive.
    let text = artifact.payload["excuse"]["text"].as_str().unwrap();
    let hits = orch
        .find_similar(text, 5, Some(ArtifactCategory::Excuse))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].similarity > 0.99);
}

#[tokio::test]
async fn redraft_returns_to_review_then_reject_aborts() {
    let generator = FakeGenerator::new(2);
    let h = harness(two_sources(), generator.clone(), FakeEvidence::new(0), fast_settings());
    let orch = &h.orchestrator;

    let run_id = orch.start_run(request()).unwrap();
    idle(orch, &run_id).await;
    orch.select_candidate(&run_id, "cand-1").unwrap();
    until(orch, &run_id, |s| s.state == RunState::AwaitingReview).await;

    orch.submit_review(
        &run_id,
        ReviewDecision::Redraft {
            notes: "mention the geese".into(),
        },
    )
    .unwrap();
    let snap = until(orch, &run_id, |s| {
        s.drafts == 2 && s.state == RunState::AwaitingReview
    })
    .await;
    assert!(snap.message.as_ref().unwrap().body.contains("mention the geese"));
    assert_eq!(generator.draft_calls.load(Ordering::SeqCst), 2);

    orch.submit_review(&run_id, ReviewDecision::Reject).unwrap();
    let snap = until(orch, &run_id, |s| s.state.is_terminal()).await;
    assert_eq!(snap.abort_reason(), Some(&PipelineError::ReviewRejected));
    assert!(snap.artifact.is_none());
    assert_eq!(h.memory.len().await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_during_evidence_leaves_no_artifact() {
    let evidence = FakeEvidence::new(300);
    let h = harness(two_sources(), FakeGenerator::new(2), evidence.clone(), fast_settings());
    let orch = &h.orchestrator;

    let run_id = orch.start_run(request()).unwrap();
    idle(orch, &run_id).await;
    orch.select_candidate(&run_id, "cand-1").unwrap();
    until(orch, &run_id, |s| s.state == RunState::BuildingEvidence).await;

    orch.cancel_run(&run_id).unwrap();
    let snap = until(orch, &run_id, |s| s.state.is_terminal()).await;
    assert_eq!(snap.abort_reason(), Some(&PipelineError::Cancelled));
    assert!(snap.artifact.is_none());
    assert_eq!(h.memory.len().await.unwrap(), 0);
    assert!(h
        .cache
        .peek(&artifact_key(&snap.fingerprint))
        .await
        .unwrap()
        .is_none());

    // The abandoned evidence computation finishes later but is not kept.
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    assert_eq!(evidence.calls.load(Ordering::SeqCst), 1);
    assert!(h
        .cache
        .peek(&evidence_key(&snap.fingerprint, "cand-1"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.cache.inflight_len(), 0);

    let err = orch.cancel_run(&run_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn cancel_while_awaiting_selection() {
    let h = harness(two_sources(), FakeGenerator::new(2), FakeEvidence::new(0), fast_settings());
    let orch = &h.orchestrator;

    let run_id = orch.start_run(request()).unwrap();
    idle(orch, &run_id).await;
    orch.cancel_run(&run_id).unwrap();
    let snap = until(orch, &run_id, |s| s.state.is_terminal()).await;
    assert_eq!(snap.abort_reason(), Some(&PipelineError::Cancelled));

    let err = orch.select_candidate(&run_id, "cand-1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

async fn remember_candidates(h: &Harness, count: usize) {
    let situation = request().situation;
    for i in 0..count {
        let text = candidate_text(i, &situation);
        h.memory
            .insert(
                h.embedder.embed_one(&text),
                serde_json::json!({ "excuse": { "text": text } }),
                RecordMetadata::new("0".repeat(64), ArtifactCategory::Excuse),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn repetitive_candidates_are_dropped() {
    let h = harness(two_sources(), FakeGenerator::new(3), FakeEvidence::new(0), fast_settings());
    remember_candidates(&h, 3).await;

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.abort_reason(), Some(&PipelineError::NoViableCandidates));
}

#[tokio::test]
async fn partially_repetitive_batch_keeps_novel_candidates() {
    let h = harness(two_sources(), FakeGenerator::new(3), FakeEvidence::new(0), fast_settings());
    remember_candidates(&h, 1).await;

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.state, RunState::AwaitingSelection);
    let ids: Vec<&str> = snap.candidates.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["cand-2", "cand-3"]);

    let err = h.orchestrator.select_candidate(&run_id, "cand-1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn flag_policy_keeps_repetitive_candidates() {
    let mut settings = fast_settings();
    settings.novelty_policy = NoveltyPolicy::Flag;
    let h = harness(two_sources(), FakeGenerator::new(2), FakeEvidence::new(0), settings);
    remember_candidates(&h, 2).await;

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.state, RunState::AwaitingSelection);
    assert_eq!(snap.candidates.len(), 2);
    for c in &snap.candidates {
        match c.novelty {
            Novelty::Repetitive { similarity } => assert!(similarity >= 0.92),
            ref other => panic!("expected repetitive, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn rate_limited_generation_is_retried() {
    let rate_limited = || PipelineError::RateLimited {
        capability: "generation".into(),
    };
    let generator = FakeGenerator::failing_first(2, vec![rate_limited(), rate_limited()]);
    let h = harness(two_sources(), generator.clone(), FakeEvidence::new(0), fast_settings());

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.state, RunState::AwaitingSelection);
    assert_eq!(generator.calls(), 3);
    assert_eq!(snap.retries.get("generation"), Some(&2));
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let rate_limited = || PipelineError::RateLimited {
        capability: "generation".into(),
    };
    let generator = FakeGenerator::failing_first(2, vec![rate_limited(); 5]);
    let h = harness(two_sources(), generator.clone(), FakeEvidence::new(0), fast_settings());

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.abort_reason().map(|e| e.kind()), Some(ErrorKind::RateLimited));
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn invalid_request_is_not_retried() {
    let generator = FakeGenerator::failing_first(
        2,
        vec![PipelineError::invalid_request("prompt rejected")],
    );
    let h = harness(two_sources(), generator.clone(), FakeEvidence::new(0), fast_settings());

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.abort_reason().map(|e| e.kind()), Some(ErrorKind::InvalidRequest));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn insufficient_sources_abort_the_run() {
    let mut settings = fast_settings();
    settings.collect.minimum_quorum = 2;
    let sources: Vec<Arc<dyn SourceCapability>> = vec![
        ScriptedSource::failing("wire", 5),
        ScriptedSource::ok("local", 5, &["Tram depot flooded"]),
        ScriptedSource::failing("blog", 10),
    ];
    let h = harness(sources, FakeGenerator::new(2), FakeEvidence::new(0), settings);

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    match snap.abort_reason() {
        Some(PipelineError::InsufficientSources {
            succeeded,
            required,
            failures,
        }) => {
            assert_eq!((*succeeded, *required), (1, 2));
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected InsufficientSources, got {:?}", other),
    }
}

#[tokio::test]
async fn identical_requests_share_one_generation() {
    let generator = FakeGenerator::slow(2, 100);
    let h = harness(two_sources(), generator.clone(), FakeEvidence::new(0), fast_settings());
    let orch = &h.orchestrator;

    let req = request();
    let first = orch.start_run(req.clone()).unwrap();
    let second = orch.start_run(req).unwrap();
    let a = idle(orch, &first).await;
    let b = idle(orch, &second).await;

    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(a.candidates, b.candidates);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn run_without_sources_is_degraded_not_failed() {
    let h = harness(Vec::new(), FakeGenerator::new(2), FakeEvidence::new(0), fast_settings());

    let run_id = h.orchestrator.start_run(request()).unwrap();
    let snap = idle(&h.orchestrator, &run_id).await;
    assert_eq!(snap.state, RunState::AwaitingSelection);
    assert!(snap.references.is_empty());
    assert!(snap.degraded.iter().any(|n| n.starts_with("collection")));
}

#[tokio::test]
async fn skipping_evidence_never_calls_the_capability() {
    let evidence = FakeEvidence::new(0);
    let h = harness(two_sources(), FakeGenerator::new(2), evidence.clone(), fast_settings());
    let orch = &h.orchestrator;

    let mut req = request();
    req.include_evidence = false;
    let run_id = orch.start_run(req).unwrap();
    idle(orch, &run_id).await;
    orch.select_candidate(&run_id, "cand-1").unwrap();
    let snap = until(orch, &run_id, |s| s.state == RunState::AwaitingReview).await;
    assert!(snap.evidence.as_ref().unwrap().is_empty());
    assert_eq!(evidence.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn decisions_in_the_wrong_state_are_rejected() {
    let h = harness(two_sources(), FakeGenerator::new(2), FakeEvidence::new(0), fast_settings());
    let orch = &h.orchestrator;

    let err = orch.get_run_state("no-such-run").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RunNotFound);

    let run_id = orch.start_run(request()).unwrap();
    idle(orch, &run_id).await;
    let err = orch
        .submit_review(&run_id, ReviewDecision::Approve)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // A bad id leaves the selection open.
    let err = orch.select_candidate(&run_id, "cand-9").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    orch.select_candidate(&run_id, "cand-1").unwrap();

    let err = orch.select_candidate(&run_id, "cand-2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(orch.list_runs().len(), 1);
}

#[tokio::test]
async fn blank_situation_is_rejected_before_the_run_starts() {
    let h = harness(two_sources(), FakeGenerator::new(2), FakeEvidence::new(0), fast_settings());
    let err = h
        .orchestrator
        .start_run(ExcuseRequest::new("   "))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(h.orchestrator.list_runs().is_empty());
}

/// Vector memory that is always down.
struct UnavailableMemory;

#[async_trait]
impl VectorMemory for UnavailableMemory {
    async fn insert(
        &self,
        _vector: Vec<f32>,
        _payload: serde_json::Value,
        _metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }

    async fn query_nearest(
        &self,
        _vector: &[f32],
        _k: usize,
        _filter: &MemoryFilter,
    ) -> PipelineResult<Vec<MemoryHit>> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }

    async fn supersede(
        &self,
        _old_id: &str,
        _vector: Vec<f32>,
        _payload: serde_json::Value,
        _metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }

    async fn get(&self, _id: &str) -> PipelineResult<Option<EmbeddingRecord>> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }

    async fn records(&self, _filter: &MemoryFilter) -> PipelineResult<Vec<EmbeddingRecord>> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }

    async fn restore(&self, _record: EmbeddingRecord) -> PipelineResult<bool> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }

    async fn len(&self) -> PipelineResult<usize> {
        Err(PipelineError::memory_unavailable("connection refused"))
    }
}

#[tokio::test]
async fn memory_outage_degrades_but_completes() {
    let h = harness_with_memory(
        two_sources(),
        FakeGenerator::new(2),
        FakeEvidence::new(0),
        fast_settings(),
        Arc::new(InMemoryVectorMemory::new()),
        Arc::new(UnavailableMemory),
    );
    let orch = &h.orchestrator;

    let run_id = orch.start_run(request()).unwrap();
    let snap = idle(orch, &run_id).await;
    assert_eq!(snap.state, RunState::AwaitingSelection);
    assert!(snap.candidates.iter().all(|c| c.novelty == Novelty::Unchecked));

    orch.select_candidate(&run_id, "cand-1").unwrap();
    until(orch, &run_id, |s| s.state == RunState::AwaitingReview).await;
    orch.submit_review(&run_id, ReviewDecision::Approve).unwrap();
    let snap = until(orch, &run_id, |s| s.state.is_terminal()).await;

    assert_eq!(snap.state, RunState::Completed);
    assert!(snap.artifact.is_some());
    assert!(snap.degraded.iter().any(|n| n.starts_with("novelty")));
    assert!(snap.degraded.iter().any(|n| n.starts_with("memory")));
    // Both inserts were retried before giving up.
    assert_eq!(snap.retries.get("memory"), Some(&4));
}

/// Vector memory whose message inserts stall past the stage timeout.
struct StallingMessages {
    inner: Arc<InMemoryVectorMemory>,
    stall: std::time::Duration,
}

#[async_trait]
impl VectorMemory for StallingMessages {
    async fn insert(
        &self,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        if metadata.category == ArtifactCategory::Message {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.insert(vector, payload, metadata).await
    }

    async fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MemoryFilter,
    ) -> PipelineResult<Vec<MemoryHit>> {
        self.inner.query_nearest(vector, k, filter).await
    }

    async fn supersede(
        &self,
        old_id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
        metadata: RecordMetadata,
    ) -> PipelineResult<String> {
        self.inner.supersede(old_id, vector, payload, metadata).await
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<EmbeddingRecord>> {
        self.inner.get(id).await
    }

    async fn records(&self, filter: &MemoryFilter) -> PipelineResult<Vec<EmbeddingRecord>> {
        self.inner.records(filter).await
    }

    async fn restore(&self, record: EmbeddingRecord) -> PipelineResult<bool> {
        self.inner.restore(record).await
    }

    async fn len(&self) -> PipelineResult<usize> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn slow_write_during_persisting_still_completes() {
    let memory = Arc::new(InMemoryVectorMemory::new());
    let mut settings = fast_settings();
    settings.stage_timeout = std::time::Duration::from_millis(800);
    let h = harness_with_memory(
        two_sources(),
        FakeGenerator::new(2),
        FakeEvidence::new(0),
        settings,
        memory.clone(),
        Arc::new(StallingMessages {
            inner: memory.clone(),
            stall: std::time::Duration::from_secs(3),
        }),
    );
    let orch = &h.orchestrator;

    let run_id = orch.start_run(request()).unwrap();
    idle(orch, &run_id).await;
    orch.select_candidate(&run_id, "cand-1").unwrap();
    until(orch, &run_id, |s| s.state == RunState::AwaitingReview).await;
    orch.submit_review(&run_id, ReviewDecision::Approve).unwrap();
    let snap = until(orch, &run_id, |s| s.state.is_terminal()).await;

    assert_eq!(snap.state, RunState::Completed);
    assert!(snap.artifact.is_some());
    assert!(
        snap.degraded
            .iter()
            .any(|n| n.starts_with("memory") && n.contains("timed out")),
        "{:?}",
        snap.degraded
    );
    let excuses = memory
        .records(&MemoryFilter::category(ArtifactCategory::Excuse))
        .await
        .unwrap();
    assert_eq!(excuses.len(), 1);
    assert!(h
        .cache
        .peek(&artifact_key(&snap.fingerprint))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn finished_runs_are_forgotten_after_retention() {
    let mut settings = fast_settings();
    settings.run_retention = std::time::Duration::from_millis(200);
    let h = harness(two_sources(), FakeGenerator::new(2), FakeEvidence::new(0), settings);
    let orch = &h.orchestrator;

    let finished = orch.start_run(request()).unwrap();
    idle(orch, &finished).await;
    orch.select_candidate(&finished, "cand-1").unwrap();
    until(orch, &finished, |s| s.state == RunState::AwaitingReview).await;
    orch.submit_review(&finished, ReviewDecision::Approve).unwrap();
    until(orch, &finished, |s| s.state == RunState::Completed).await;

    let waiting = orch.start_run(ExcuseRequest::new("missed the train")).unwrap();
    idle(orch, &waiting).await;

    assert!(orch.get_run_state(&finished).is_ok());
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let err = orch.get_run_state(&finished).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RunNotFound);
    // Runs still waiting on the caller are kept.
    let listed: Vec<String> = orch.list_runs().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![waiting.clone()]);
    assert_eq!(
        orch.get_run_state(&waiting).unwrap().state,
        RunState::AwaitingSelection
    );
}
