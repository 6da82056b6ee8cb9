//! Pipeline orchestrator: drives runs through every stage.
//!
//! The [`Orchestrator`] is the only component that changes a run's state
//! and the only one that talks to the cache, vector memory and external
//! capabilities on a run's behalf. Each run executes on its own task;
//! callers interact with it through run ids.
//!
//! # Stages
//!
//! | State | Work | Cache key |
//! |-------|------|-----------|
//! | `Collecting` | fan out to sources ([`collector::collect`]) | `(topic fingerprint, raw_material)` |
//! | `Filtering` | relevance floor and item cap | — |
//! | `Generating` | candidates, then novelty check | `(fingerprint, generated_text)` |
//! | `AwaitingSelection` | caller picks a candidate | — |
//! | `BuildingEvidence` | evidence bundle | `(fingerprint/evidence:<candidate>, evidence_asset)` |
//! | `Drafting` | message draft | `(fingerprint/draft:<candidate>:<n>:<notes>, generated_text)` |
//! | `AwaitingReview` | approve, redraft or reject | — |
//! | `Persisting` | vector memory + cache | `(fingerprint/artifact, generated_text)` |
//!
//! Capability calls go through the configured [`RetryPolicy`]. Working
//! stages are bounded by `stage_timeout` and stop as soon as the run's
//! cancellation token fires; waiting stages have no timeout of their own.
//! `Persisting` bounds each write separately and always completes, so a
//! run never ends aborted with half an artifact stored.
//! A permit from a semaphore of `max_concurrent_runs` is held only while a
//! run is working, never while it waits on the caller.
//!
//! Vector memory and cache failures never abort a run. They are logged
//! and recorded in [`RunSnapshot::degraded`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use excuse_harness_core::cache::CacheKey;
use excuse_harness_core::memory::{MemoryFilter, MemoryHit, RecordMetadata, VectorMemory};
use excuse_harness_core::merge::filter_for_generation;
use excuse_harness_core::models::{
    Artifact, ArtifactCategory, CacheCategory, CandidateExcuse, CollectionResult, DraftedMessage,
    EvidenceBundle, ExcuseRequest, Novelty,
};
use excuse_harness_core::{
    fingerprint, topic_fingerprint, Fingerprint, PipelineError, PipelineResult,
};

use crate::cache::CacheLayer;
use crate::capabilities::{Capabilities, GenerationContext};
use crate::collector::{self, CollectOptions};
use crate::config::{
    CollectionConfig, Config, GenerationConfig, MemoryConfig, NoveltyPolicy, PipelineConfig,
};
use crate::retry::RetryPolicy;
use crate::run::{ReviewDecision, RunSnapshot, RunState};

/// Tunables for the orchestrator, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub collect: CollectOptions,
    pub relevance_floor: f64,
    pub max_reference_items: usize,
    pub max_candidates: usize,
    pub min_candidates: usize,
    pub novelty_threshold: f32,
    pub novelty_policy: NoveltyPolicy,
    pub stage_timeout: Duration,
    pub max_concurrent_runs: usize,
    /// Finished runs are forgotten this long after they end.
    pub run_retention: Duration,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self::from_sections(
            &config.collection,
            &config.generation,
            &config.memory,
            &config.pipeline,
        )
    }

    fn from_sections(
        collection: &CollectionConfig,
        generation: &GenerationConfig,
        memory: &MemoryConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            collect: CollectOptions::from_config(collection),
            relevance_floor: collection.relevance_floor,
            max_reference_items: collection.max_reference_items,
            max_candidates: generation.max_candidates,
            min_candidates: generation.min_candidates,
            novelty_threshold: memory.novelty_threshold,
            novelty_policy: memory.novelty_policy,
            stage_timeout: pipeline.stage_timeout(),
            max_concurrent_runs: pipeline.max_concurrent_runs,
            run_retention: pipeline.run_retention(),
            retry: RetryPolicy::from_config(&pipeline.retry),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_sections(
            &CollectionConfig::default(),
            &GenerationConfig::default(),
            &MemoryConfig::default(),
            &PipelineConfig::default(),
        )
    }
}

/// A decision the run task is currently waiting for.
enum Pending {
    Selection {
        candidates: Vec<String>,
        reply: oneshot::Sender<String>,
    },
    Review(oneshot::Sender<ReviewDecision>),
}

struct RunHandle {
    snapshot: watch::Sender<RunSnapshot>,
    cancel: CancellationToken,
    pending: Mutex<Option<Pending>>,
}

impl RunHandle {
    fn publish(&self, snap: &RunSnapshot) {
        self.snapshot.send_replace(snap.clone());
    }

    fn set_pending(&self, pending: Option<Pending>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = pending;
    }
}

struct Inner {
    settings: PipelineSettings,
    cache: Arc<CacheLayer>,
    memory: Arc<dyn VectorMemory>,
    capabilities: Capabilities,
    permits: Arc<Semaphore>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

/// Cheap to clone; clones share runs and stores.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        cache: Arc<CacheLayer>,
        memory: Arc<dyn VectorMemory>,
        capabilities: Capabilities,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1)));
        Self {
            inner: Arc::new(Inner {
                settings,
                cache,
                memory,
                capabilities,
                permits,
                runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.inner.cache
    }

    pub fn memory(&self) -> &Arc<dyn VectorMemory> {
        &self.inner.memory
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Validate `request` and start a run on a new task. Must be called
    /// from within a Tokio runtime.
    pub fn start_run(&self, request: ExcuseRequest) -> PipelineResult<String> {
        let fp = fingerprint(&request, None)?;
        let id = Uuid::new_v4().to_string();
        let snap = RunSnapshot::new(id.clone(), fp.to_string(), request, Utc::now());

        let (snapshot, _) = watch::channel(snap.clone());
        let handle = Arc::new(RunHandle {
            snapshot,
            cancel: CancellationToken::new(),
            pending: Mutex::new(None),
        });
        self.inner
            .runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), handle.clone());

        tracing::info!(run_id = %id, fingerprint = %fp, "run started");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(handle, snap, fp).await });
        Ok(id)
    }

    pub fn get_run_state(&self, run_id: &str) -> PipelineResult<RunSnapshot> {
        Ok(self.inner.handle(run_id)?.snapshot.borrow().clone())
    }

    /// Every known run, oldest first. Finished runs stay listed for
    /// `run_retention` after they end.
    pub fn list_runs(&self) -> Vec<RunSnapshot> {
        let runs = self.inner.runs.read().unwrap_or_else(|e| e.into_inner());
        let mut snaps: Vec<RunSnapshot> = runs.values().map(|h| h.snapshot.borrow().clone()).collect();
        snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snaps
    }

    /// Choose the candidate to continue with. Only valid while the run is
    /// `AwaitingSelection`.
    pub fn select_candidate(&self, run_id: &str, candidate_id: &str) -> PipelineResult<()> {
        let handle = self.inner.handle(run_id)?;
        let mut pending = handle.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(Pending::Selection { candidates, reply }) => {
                if !candidates.iter().any(|c| c == candidate_id) {
                    *pending = Some(Pending::Selection { candidates, reply });
                    return Err(PipelineError::invalid_request(format!(
                        "run {} has no candidate {}",
                        run_id, candidate_id
                    )));
                }
                tracing::info!(run_id, candidate_id, "candidate selected");
                reply.send(candidate_id.to_string()).map_err(|_| not_waiting(run_id, "selection"))
            }
            other => {
                *pending = other;
                Err(not_waiting(run_id, "selection"))
            }
        }
    }

    /// Decide on the drafted message. Only valid while the run is
    /// `AwaitingReview`.
    pub fn submit_review(&self, run_id: &str, decision: ReviewDecision) -> PipelineResult<()> {
        let handle = self.inner.handle(run_id)?;
        let mut pending = handle.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(Pending::Review(reply)) => {
                tracing::info!(run_id, decision = ?decision, "review submitted");
                reply.send(decision).map_err(|_| not_waiting(run_id, "review"))
            }
            other => {
                *pending = other;
                Err(not_waiting(run_id, "review"))
            }
        }
    }

    /// Ask the run to stop. The run reaches `Aborted { Cancelled }` as soon
    /// as its current operation observes the signal.
    pub fn cancel_run(&self, run_id: &str) -> PipelineResult<()> {
        let handle = self.inner.handle(run_id)?;
        let state = handle.snapshot.borrow().state.clone();
        if state.is_terminal() {
            return Err(PipelineError::InvalidState {
                reason: format!("run {} already {}", run_id, state.name()),
            });
        }
        tracing::info!(run_id, stage = state.name(), "cancel requested");
        handle.cancel.cancel();
        Ok(())
    }

    /// Wait until `predicate` holds for the run's snapshot.
    pub async fn wait_for<P>(&self, run_id: &str, mut predicate: P) -> PipelineResult<RunSnapshot>
    where
        P: FnMut(&RunSnapshot) -> bool,
    {
        let mut rx = self.inner.handle(run_id)?.snapshot.subscribe();
        let snap = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| PipelineError::InvalidState {
                reason: format!("run {} is no longer tracked", run_id),
            })?
            .clone();
        Ok(snap)
    }

    /// Wait until the run needs the caller or has finished.
    pub async fn wait_until_idle(&self, run_id: &str) -> PipelineResult<RunSnapshot> {
        self.wait_for(run_id, |s| s.state.is_waiting() || s.state.is_terminal())
            .await
    }

    /// Past artifacts most similar to `text`, optionally limited to one
    /// category.
    pub async fn find_similar(
        &self,
        text: &str,
        k: usize,
        category: Option<ArtifactCategory>,
    ) -> PipelineResult<Vec<MemoryHit>> {
        if text.trim().is_empty() {
            return Err(PipelineError::invalid_request("query text is empty"));
        }
        let vectors = self
            .inner
            .capabilities
            .embedder
            .embed(&[text.to_string()])
            .await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            PipelineError::capability_unavailable("embedding", "provider returned no vector")
        })?;
        let filter = MemoryFilter {
            category,
            ..MemoryFilter::default()
        };
        self.inner.memory.query_nearest(&vector, k, &filter).await
    }
}

fn not_waiting(run_id: &str, what: &str) -> PipelineError {
    PipelineError::InvalidState {
        reason: format!("run {} is not awaiting {}", run_id, what),
    }
}

fn settle<T>(
    snap: &mut RunSnapshot,
    label: &str,
    outcome: Result<(T, u32), (PipelineError, u32)>,
) -> PipelineResult<T> {
    match outcome {
        Ok((value, retries)) => {
            snap.add_retries(label, retries);
            Ok(value)
        }
        Err((err, retries)) => {
            snap.add_retries(label, retries);
            Err(err)
        }
    }
}

async fn wait_for_caller<T>(
    cancel: &CancellationToken,
    reply: oneshot::Receiver<T>,
) -> PipelineResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        decision = reply => decision.map_err(|_| PipelineError::InvalidState {
            reason: "decision channel closed".to_string(),
        }),
    }
}

impl Inner {
    fn handle(&self, run_id: &str) -> PipelineResult<Arc<RunHandle>> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
            .ok_or_else(|| PipelineError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn drive(self: Arc<Self>, handle: Arc<RunHandle>, mut snap: RunSnapshot, fp: Fingerprint) {
        let result = self.execute(&handle, &mut snap, &fp).await;
        handle.set_pending(None);

        match result {
            Ok(()) => {
                tracing::info!(run_id = %snap.id, drafts = snap.drafts, "run completed");
            }
            Err(err) => {
                let reason = if handle.cancel.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    err.root().clone()
                };
                tracing::warn!(
                    run_id = %snap.id,
                    stage = snap.state.name(),
                    reason = %reason,
                    "run aborted"
                );
                if let Err(e) = snap.transition(RunState::Aborted { reason }, Utc::now()) {
                    tracing::error!(run_id = %snap.id, error = %e, "cannot record abort");
                }
                handle.publish(&snap);
            }
        }

        tokio::time::sleep(self.settings.run_retention).await;
        self.forget(&snap.id);
    }

    fn forget(&self, run_id: &str) {
        let removed = self
            .runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .is_some();
        if removed {
            tracing::debug!(run_id, "finished run evicted");
        }
    }

    fn enter(&self, handle: &RunHandle, snap: &mut RunSnapshot, next: RunState) -> PipelineResult<()> {
        snap.transition(next, Utc::now())?;
        tracing::info!(run_id = %snap.id, stage = snap.state.name(), "stage entered");
        handle.publish(snap);
        Ok(())
    }

    async fn acquire(&self, cancel: &CancellationToken) -> PipelineResult<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| PipelineError::InvalidState {
                reason: "orchestrator is shutting down".to_string(),
            }),
        }
    }

    /// Run a working stage under the stage timeout, stopping on cancel.
    async fn bounded<T>(
        &self,
        stage: &str,
        cancel: &CancellationToken,
        work: impl Future<Output = PipelineResult<T>>,
    ) -> PipelineResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = tokio::time::timeout(self.settings.stage_timeout, work) => {
                result.unwrap_or_else(|_| Err(PipelineError::StageTimeout { stage: stage.to_string() }))
            }
        }
    }

    async fn execute(
        &self,
        handle: &RunHandle,
        snap: &mut RunSnapshot,
        fp: &Fingerprint,
    ) -> PipelineResult<()> {
        let cancel = handle.cancel.clone();
        let mut permit = Some(self.acquire(&cancel).await?);

        let collection = self
            .bounded("collecting", &cancel, self.collect(snap))
            .await?;
        tracing::info!(
            run_id = %snap.id,
            items = collection.items.len(),
            sources = collection.reports.len(),
            "reference material collected"
        );
        snap.collection = Some(collection);

        self.enter(handle, snap, RunState::Filtering)?;
        let items = snap
            .collection
            .as_ref()
            .map(|c| c.items.as_slice())
            .unwrap_or_default();
        snap.references = filter_for_generation(
            items,
            self.settings.relevance_floor,
            self.settings.max_reference_items,
        );

        self.enter(handle, snap, RunState::Generating)?;
        let candidates = self
            .bounded("generating", &cancel, self.generate(snap, fp, &cancel))
            .await?;
        let (reply, decision) = oneshot::channel();
        handle.set_pending(Some(Pending::Selection {
            candidates: candidates.iter().map(|c| c.id.clone()).collect(),
            reply,
        }));
        snap.candidates = candidates;
        drop(permit.take());
        self.enter(handle, snap, RunState::AwaitingSelection)?;

        let selected_id = wait_for_caller(&cancel, decision).await?;
        let excuse = snap.candidate(&selected_id).cloned().ok_or_else(|| {
            PipelineError::invalid_request(format!("unknown candidate {}", selected_id))
        })?;
        snap.selected = Some(excuse.clone());
        permit = Some(self.acquire(&cancel).await?);

        self.enter(handle, snap, RunState::BuildingEvidence)?;
        let evidence = self
            .bounded(
                "building_evidence",
                &cancel,
                self.build_evidence(snap, fp, &cancel, &excuse),
            )
            .await?;
        snap.evidence = Some(evidence.clone());

        let mut notes: Option<String> = None;
        loop {
            self.enter(handle, snap, RunState::Drafting)?;
            let message = self
                .bounded(
                    "drafting",
                    &cancel,
                    self.draft(snap, fp, &cancel, &excuse, &evidence, notes.as_deref()),
                )
                .await?;
            snap.drafts += 1;
            snap.message = Some(message);

            let (reply, decision) = oneshot::channel();
            handle.set_pending(Some(Pending::Review(reply)));
            drop(permit.take());
            self.enter(handle, snap, RunState::AwaitingReview)?;

            let decision = wait_for_caller(&cancel, decision).await?;
            permit = Some(self.acquire(&cancel).await?);
            match decision {
                ReviewDecision::Approve => break,
                ReviewDecision::Redraft { notes: n } => notes = Some(n),
                ReviewDecision::Reject => return Err(PipelineError::ReviewRejected),
            }
        }

        self.enter(handle, snap, RunState::Persisting)?;
        // Past this check the run always completes. Each write is bounded
        // on its own and a failed write is recorded as degraded.
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let artifact = self.persist(snap, fp).await?;
        snap.artifact = Some(artifact);
        self.enter(handle, snap, RunState::Completed)?;
        drop(permit);
        Ok(())
    }

    async fn collect(&self, snap: &mut RunSnapshot) -> PipelineResult<CollectionResult> {
        let sources = self.capabilities.sources.sources().to_vec();
        if sources.is_empty() {
            tracing::warn!(run_id = %snap.id, "no sources configured, skipping collection");
            snap.note_degraded("collection: no sources configured");
            return Ok(CollectionResult {
                items: Vec::new(),
                reports: Vec::new(),
                collected_at: Utc::now(),
            });
        }

        let key = CacheKey::new(topic_fingerprint(&snap.request)?, CacheCategory::RawMaterial);
        let topic = snap.request.topic();
        let options = self.settings.collect;
        self.cache
            .get_or_compute_as(key, move || async move {
                collector::collect(&topic, &sources, options).await
            })
            .await
    }

    async fn generate(
        &self,
        snap: &mut RunSnapshot,
        fp: &Fingerprint,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<CandidateExcuse>> {
        let context = GenerationContext {
            request: snap.request.clone(),
            references: snap.references.clone(),
            max_candidates: self.settings.max_candidates,
        };
        let key = CacheKey::new(fp.clone(), CacheCategory::GeneratedText);
        let generation = &self.capabilities.generation;
        let cache = &self.cache;

        let outcome = self
            .settings
            .retry
            .run("generation", cancel, || {
                let key = key.clone();
                let generation = generation.clone();
                let context = context.clone();
                async move {
                    cache
                        .get_or_compute_as(key, move || async move {
                            generation.generate(&context).await
                        })
                        .await
                }
            })
            .await;
        let mut candidates: Vec<CandidateExcuse> = settle(snap, "generation", outcome)?;
        candidates.truncate(self.settings.max_candidates);
        if candidates.is_empty() {
            return Err(PipelineError::NoViableCandidates);
        }

        self.check_novelty(snap, &mut candidates, cancel).await?;
        let generated = candidates.len();
        if self.settings.novelty_policy == NoveltyPolicy::Drop {
            candidates.retain(|c| !matches!(c.novelty, Novelty::Repetitive { .. }));
        }
        if candidates.is_empty() {
            tracing::warn!(run_id = %snap.id, generated, "every candidate repeats a past excuse");
            return Err(PipelineError::NoViableCandidates);
        }
        if candidates.len() < self.settings.min_candidates {
            tracing::warn!(
                run_id = %snap.id,
                candidates = candidates.len(),
                min_candidates = self.settings.min_candidates,
                "fewer candidates than requested"
            );
        }
        tracing::info!(
            run_id = %snap.id,
            generated,
            kept = candidates.len(),
            "candidates ready"
        );
        Ok(candidates)
    }

    /// Mark each candidate novel or repetitive. Failures downgrade the
    /// whole batch to `Unchecked`; only cancellation is an error.
    async fn check_novelty(
        &self,
        snap: &mut RunSnapshot,
        candidates: &mut [CandidateExcuse],
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embed(snap, &texts, cancel).await {
            Ok(v) => v,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::warn!(run_id = %snap.id, error = %e, "novelty check skipped");
                snap.note_degraded(format!("novelty: {}", e));
                return Ok(());
            }
        };

        for (candidate, vector) in candidates.iter_mut().zip(&vectors) {
            match self
                .memory
                .novelty(vector, ArtifactCategory::Excuse, self.settings.novelty_threshold)
                .await
            {
                Ok(novelty) => candidate.novelty = novelty,
                Err(e) => {
                    tracing::warn!(run_id = %snap.id, error = %e, "novelty check skipped");
                    snap.note_degraded(format!("novelty: {}", e));
                    for c in candidates.iter_mut() {
                        c.novelty = Novelty::Unchecked;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn embed(
        &self,
        snap: &mut RunSnapshot,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<Vec<f32>>> {
        let embedder = &self.capabilities.embedder;
        let outcome = self
            .settings
            .retry
            .run("embedding", cancel, || embedder.embed(texts))
            .await;
        let vectors = settle(snap, "embedding", outcome)?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::capability_unavailable(
                "embedding",
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }

    async fn build_evidence(
        &self,
        snap: &mut RunSnapshot,
        fp: &Fingerprint,
        cancel: &CancellationToken,
        excuse: &CandidateExcuse,
    ) -> PipelineResult<EvidenceBundle> {
        if !snap.request.include_evidence {
            return Ok(EvidenceBundle::empty(excuse.id.clone()));
        }
        let key = CacheKey::new(
            fp.derive(&format!("evidence:{}", excuse.id)),
            CacheCategory::EvidenceAsset,
        );
        let evidence = &self.capabilities.evidence;
        let cache = &self.cache;

        let outcome = self
            .settings
            .retry
            .run("evidence", cancel, || {
                let key = key.clone();
                let evidence = evidence.clone();
                let excuse = excuse.clone();
                async move {
                    cache
                        .get_or_compute_as(key, move || async move { evidence.build(&excuse).await })
                        .await
                }
            })
            .await;
        let bundle: EvidenceBundle = settle(snap, "evidence", outcome)?;
        tracing::info!(run_id = %snap.id, items = bundle.items.len(), "evidence built");
        Ok(bundle)
    }

    async fn draft(
        &self,
        snap: &mut RunSnapshot,
        fp: &Fingerprint,
        cancel: &CancellationToken,
        excuse: &CandidateExcuse,
        evidence: &EvidenceBundle,
        notes: Option<&str>,
    ) -> PipelineResult<DraftedMessage> {
        let key = CacheKey::new(
            fp.derive(&format!(
                "draft:{}:{}:{}",
                excuse.id,
                snap.drafts,
                notes.unwrap_or_default()
            )),
            CacheCategory::GeneratedText,
        );
        let generation = &self.capabilities.generation;
        let cache = &self.cache;
        let request = &snap.request;

        let outcome = self
            .settings
            .retry
            .run("generation", cancel, || {
                let key = key.clone();
                let generation = generation.clone();
                let request = request.clone();
                let excuse = excuse.clone();
                let evidence = evidence.clone();
                let notes = notes.map(str::to_string);
                async move {
                    cache
                        .get_or_compute_as(key, move || async move {
                            generation
                                .draft(&request, &excuse, &evidence, notes.as_deref())
                                .await
                        })
                        .await
                }
            })
            .await;
        settle(snap, "generation", outcome)
    }

    async fn persist(&self, snap: &mut RunSnapshot, fp: &Fingerprint) -> PipelineResult<Artifact> {
        let excuse = snap.selected.clone().ok_or_else(|| PipelineError::InvalidState {
            reason: "no candidate selected".to_string(),
        })?;
        let message = snap.message.clone().ok_or_else(|| PipelineError::InvalidState {
            reason: "no drafted message".to_string(),
        })?;
        let evidence = snap
            .evidence
            .clone()
            .unwrap_or_else(|| EvidenceBundle::empty(excuse.id.clone()));

        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            fingerprint: fp.to_string(),
            category: ArtifactCategory::Excuse,
            payload: json!({
                "run_id": snap.id,
                "excuse": excuse,
                "evidence": evidence,
                "message": message,
            }),
            plausibility_score: Some(excuse.plausibility),
            created_at: Utc::now(),
        };

        // A separate token: persistence runs to the end once started.
        let uninterrupted = CancellationToken::new();
        let texts = vec![excuse.text.clone(), message.body.clone()];
        let embedded = self
            .within("embedding", self.embed(snap, &texts, &uninterrupted))
            .await;
        match embedded {
            Ok(vectors) => {
                let records = [
                    (
                        ArtifactCategory::Excuse,
                        json!({
                            "artifact_id": artifact.id,
                            "run_id": snap.id,
                            "excuse": excuse,
                            "evidence": evidence,
                        }),
                    ),
                    (
                        ArtifactCategory::Message,
                        json!({
                            "artifact_id": artifact.id,
                            "run_id": snap.id,
                            "excuse_id": excuse.id,
                            "message": message,
                        }),
                    ),
                ];
                for ((category, payload), vector) in records.into_iter().zip(vectors) {
                    let stored = self
                        .within(
                            "memory",
                            self.remember(snap, fp, category, vector, payload, &uninterrupted),
                        )
                        .await;
                    match stored {
                        Ok(id) => {
                            tracing::debug!(run_id = %snap.id, record_id = %id, category = category.as_str(), "memory record stored");
                        }
                        Err(e) => {
                            tracing::warn!(run_id = %snap.id, error = %e, category = category.as_str(), "memory record not stored");
                            snap.note_degraded(format!("memory: {}", e));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(run_id = %snap.id, error = %e, "artifact not stored in memory");
                snap.note_degraded(format!("memory: {}", e));
            }
        }

        let key = CacheKey::new(fp.derive("artifact"), CacheCategory::GeneratedText);
        let stored = match serde_json::to_value(&artifact) {
            Ok(value) => self.within("cache", self.cache.put(key, value)).await,
            Err(e) => Err(PipelineError::InvalidState {
                reason: format!("cannot encode artifact: {}", e),
            }),
        };
        if let Err(e) = stored {
            tracing::warn!(run_id = %snap.id, error = %e, "artifact not cached");
            snap.note_degraded(format!("cache: {}", e));
        }

        tracing::info!(run_id = %snap.id, artifact_id = %artifact.id, "artifact persisted");
        Ok(artifact)
    }

    /// Bound one persistence write by the stage timeout.
    async fn within<T>(
        &self,
        what: &str,
        work: impl Future<Output = PipelineResult<T>>,
    ) -> PipelineResult<T> {
        tokio::time::timeout(self.settings.stage_timeout, work)
            .await
            .unwrap_or_else(|_| {
                Err(PipelineError::StageTimeout {
                    stage: format!("persisting:{}", what),
                })
            })
    }

    async fn remember(
        &self,
        snap: &mut RunSnapshot,
        fp: &Fingerprint,
        category: ArtifactCategory,
        vector: Vec<f32>,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let memory = &self.memory;
        let outcome = self
            .settings
            .retry
            .run("memory", cancel, || {
                memory.insert(
                    vector.clone(),
                    payload.clone(),
                    RecordMetadata::new(fp.as_str(), category),
                )
            })
            .await;
        settle(snap, "memory", outcome)
    }
}
