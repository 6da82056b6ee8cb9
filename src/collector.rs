//! Collection coordinator: parallel fan-out to reference-material sources.
//!
//! # Algorithm
//!
//! 1. Every source is fetched concurrently, each bounded by
//!    `per_source_timeout` (enforced here even if the source ignores it).
//! 2. Results are consumed as they complete. Failures and timeouts are
//!    recorded and never retried within the call.
//! 3. As soon as `minimum_quorum` sources have succeeded, the remaining
//!    fetches are dropped and reported [`SourceOutcome::Abandoned`].
//! 4. As soon as quorum can no longer be reached, the call fails with
//!    `InsufficientSources`.
//! 5. Successful batches are merged in source registration order by
//!    [`merge_batches`]: near-duplicates collapse, items are ordered by
//!    relevance, then recency, then arrival.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

use excuse_harness_core::merge::{merge_batches, SourceBatch};
use excuse_harness_core::models::{CollectionResult, SourceOutcome, SourceReport};
use excuse_harness_core::{PipelineError, PipelineResult};

use crate::capabilities::SourceCapability;
use crate::config::CollectionConfig;

/// Parameters of one collection call.
#[derive(Debug, Clone, Copy)]
pub struct CollectOptions {
    pub per_source_timeout: Duration,
    pub minimum_quorum: usize,
    pub dedup_threshold: f64,
}

impl CollectOptions {
    pub fn from_config(config: &CollectionConfig) -> Self {
        Self {
            per_source_timeout: config.per_source_timeout(),
            minimum_quorum: config.minimum_quorum,
            dedup_threshold: config.dedup_threshold,
        }
    }
}

pub async fn collect(
    topic: &str,
    sources: &[Arc<dyn SourceCapability>],
    options: CollectOptions,
) -> PipelineResult<CollectionResult> {
    if topic.trim().is_empty() {
        return Err(PipelineError::invalid_request("collection topic is empty"));
    }
    let required = options.minimum_quorum;
    if required == 0 || required > sources.len() {
        return Err(PipelineError::invalid_request(format!(
            "minimum_quorum {} must be between 1 and the number of sources ({})",
            required,
            sources.len()
        )));
    }

    let started = Instant::now();
    let timeout = options.per_source_timeout;
    let mut pending: FuturesUnordered<_> = sources
        .iter()
        .enumerate()
        .map(|(idx, source)| {
            let source = source.clone();
            let topic = topic.to_string();
            async move {
                let begin = Instant::now();
                let result = tokio::time::timeout(timeout, source.fetch(&topic, timeout)).await;
                (idx, result, begin.elapsed())
            }
        })
        .collect();

    let mut reports: Vec<Option<SourceReport>> = vec![None; sources.len()];
    let mut batches: Vec<Option<SourceBatch>> = vec![None; sources.len()];
    let mut failures: Vec<String> = Vec::new();
    let mut succeeded = 0usize;
    let mut finished = 0usize;

    while let Some((idx, result, elapsed)) = pending.next().await {
        finished += 1;
        let source = &sources[idx];
        let name = source.name().to_string();
        let elapsed_ms = elapsed.as_millis() as u64;

        let outcome = match result {
            Ok(Ok(items)) => {
                succeeded += 1;
                tracing::debug!(source = %name, items = items.len(), elapsed_ms, "source succeeded");
                let outcome = SourceOutcome::Succeeded { items: items.len() };
                batches[idx] = Some(SourceBatch {
                    source: name.clone(),
                    trust_weight: source.trust_weight(),
                    items,
                });
                outcome
            }
            Ok(Err(PipelineError::SourceTimeout { .. })) | Err(_) => {
                tracing::warn!(source = %name, elapsed_ms, "source timed out");
                failures.push(format!("{}: timed out", name));
                SourceOutcome::TimedOut
            }
            Ok(Err(e)) => {
                tracing::warn!(source = %name, error = %e, "source failed");
                let reason = match e {
                    PipelineError::SourceError { reason, .. } => reason,
                    other => other.to_string(),
                };
                failures.push(format!("{}: {}", name, reason));
                SourceOutcome::Failed { reason }
            }
        };
        reports[idx] = Some(SourceReport {
            source: name,
            outcome,
            elapsed_ms,
        });

        if succeeded >= required {
            break;
        }
        let outstanding = sources.len() - finished;
        if succeeded + outstanding < required {
            return Err(PipelineError::InsufficientSources {
                succeeded,
                required,
                failures,
            });
        }
    }
    drop(pending);

    let abandoned_ms = started.elapsed().as_millis() as u64;
    let reports: Vec<SourceReport> = reports
        .into_iter()
        .zip(sources)
        .map(|(report, source)| {
            report.unwrap_or_else(|| {
                tracing::debug!(source = %source.name(), "source abandoned after quorum");
                SourceReport {
                    source: source.name().to_string(),
                    outcome: SourceOutcome::Abandoned,
                    elapsed_ms: abandoned_ms,
                }
            })
        })
        .collect();

    let items = merge_batches(
        batches.into_iter().flatten().collect(),
        topic,
        options.dedup_threshold,
    );
    tracing::info!(
        sources = sources.len(),
        succeeded,
        items = items.len(),
        elapsed_ms = abandoned_ms,
        "collection complete"
    );

    Ok(CollectionResult {
        items,
        reports,
        collected_at: chrono::Utc::now(),
    })
}
