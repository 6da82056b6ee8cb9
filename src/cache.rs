//! Tiered, single-flight cache layer.
//!
//! [`CacheLayer`] sits in front of a [`CacheBackend`] and adds:
//!
//! - **TTL policy**: every entry gets `expires_at = now + ttl(category)`
//!   from a [`TtlPolicy`]. Expired entries are never returned; they are
//!   deleted lazily on read and by [`CacheLayer::purge_expired`].
//! - **Single-flight**: concurrent [`get_or_compute`](CacheLayer::get_or_compute)
//!   calls for the same key share one computation. The first caller spawns
//!   it; later callers attach to the same shared future. Unrelated keys
//!   never contend beyond a brief map lock.
//! - **Degraded mode**: when the backend reports `CacheUnavailable`, the
//!   layer logs a warning and runs the computation directly.
//!
//! ```text
//! get_or_compute(key)
//!   ├─ backend hit, fresh ──────────────▶ payload
//!   ├─ backend unavailable ─────────────▶ compute() (uncached)
//!   └─ miss / expired
//!        ├─ flight in progress ─────────▶ await shared flight
//!        └─ none: spawn flight
//!               re-check backend → compute() → store → leave map
//! ```
//!
//! Flights run on their own task. A caller that stops waiting (for
//! example because its run was cancelled) abandons the flight without
//! stopping it, so other waiters still receive the result. A flight whose
//! waiters have all gone finishes but stores nothing: a cancelled run
//! leaves no cache entry behind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;

use excuse_harness_core::cache::{CacheBackend, CacheEntry, CacheKey};
use excuse_harness_core::clock::{Clock, SystemClock};
use excuse_harness_core::models::CacheCategory;
use excuse_harness_core::{Fingerprint, PipelineError, PipelineResult};

use crate::config::CacheConfig;

type FlightMap = Arc<Mutex<HashMap<CacheKey, Flight>>>;

#[derive(Clone)]
struct Flight {
    result: Shared<BoxFuture<'static, PipelineResult<serde_json::Value>>>,
    waiters: Arc<AtomicUsize>,
}

impl Flight {
    /// Register a caller. The returned guard counts it until dropped.
    fn attach(&self) -> Waiter {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        Waiter(self.waiters.clone())
    }
}

struct Waiter(Arc<AtomicUsize>);

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes a flight from the map when its task ends, including by panic.
struct Departure {
    inflight: FlightMap,
    key: CacheKey,
}

impl Drop for Departure {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Time-to-live per [`CacheCategory`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlPolicy {
    pub raw_material: chrono::Duration,
    pub generated_text: chrono::Duration,
    pub evidence_asset: chrono::Duration,
}

impl TtlPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        let secs = |c| chrono::Duration::seconds(config.ttl_secs(c) as i64);
        Self {
            raw_material: secs(CacheCategory::RawMaterial),
            generated_text: secs(CacheCategory::GeneratedText),
            evidence_asset: secs(CacheCategory::EvidenceAsset),
        }
    }

    pub fn ttl(&self, category: CacheCategory) -> chrono::Duration {
        match category {
            CacheCategory::RawMaterial => self.raw_material,
            CacheCategory::GeneratedText => self.generated_text,
            CacheCategory::EvidenceAsset => self.evidence_asset,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    ttl: TtlPolicy,
    clock: Arc<dyn Clock>,
    inflight: FlightMap,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: TtlPolicy) -> Self {
        Self {
            backend,
            ttl,
            clock: Arc::new(SystemClock),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the time source (tests use a manual clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Number of computations currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Return the fresh entry for `key`, or run `compute` once across all
    /// concurrent callers, store its result, and return it to all of them.
    ///
    /// A failed computation reaches every waiter as `ComputationFailed` and
    /// nothing is stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> PipelineResult<serde_json::Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<serde_json::Value>> + Send + 'static,
    {
        match self.fresh(&key).await {
            Ok(Some(payload)) => {
                tracing::debug!(key = %key, "cache hit");
                return Ok(payload);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache backend unavailable, computing uncached");
                return compute().await.map_err(PipelineError::computation_failed);
            }
        }

        let (flight, _waiter) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            // Joiners attach under the map lock so a finishing flight
            // either sees them or has already left the map.
            match inflight.get(&key) {
                Some(existing) => {
                    tracing::debug!(key = %key, "joining in-flight computation");
                    (existing.clone(), existing.attach())
                }
                None => {
                    tracing::debug!(key = %key, "cache miss, starting computation");
                    let (flight, waiter) = self.spawn_flight(key.clone(), compute);
                    inflight.insert(key, flight.clone());
                    (flight, waiter)
                }
            }
        };

        flight.result.await
    }

    /// Start a flight with the calling waiter already attached.
    fn spawn_flight<F, Fut>(&self, key: CacheKey, compute: F) -> (Flight, Waiter)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<serde_json::Value>> + Send + 'static,
    {
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let ttl = self.ttl.ttl(key.category);
        let waiters = Arc::new(AtomicUsize::new(1));
        let creator = Waiter(waiters.clone());
        let departure = Departure {
            inflight: self.inflight.clone(),
            key: key.clone(),
        };

        let task = {
            let waiters = waiters.clone();
            tokio::spawn(async move {
                let _departure = departure;
                run_flight(&*backend, &*clock, ttl, &key, &waiters, compute).await
            })
        };

        let result = async move {
            task.await.unwrap_or_else(|e| {
                Err(PipelineError::computation_failed(PipelineError::InvalidState {
                    reason: format!("cache computation aborted: {}", e),
                }))
            })
        }
        .boxed()
        .shared();

        (Flight { result, waiters }, creator)
    }

    /// Typed [`get_or_compute`](Self::get_or_compute) via serde JSON.
    pub async fn get_or_compute_as<T, F, Fut>(&self, key: CacheKey, compute: F) -> PipelineResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
    {
        let value = self
            .get_or_compute(key.clone(), move || async move {
                let typed = compute().await?;
                serde_json::to_value(typed).map_err(|e| PipelineError::InvalidState {
                    reason: format!("cannot encode payload: {}", e),
                })
            })
            .await?;
        self.decode(&key, value).await
    }

    /// Fresh payload for `key`, if any. Never computes.
    pub async fn peek(&self, key: &CacheKey) -> PipelineResult<Option<serde_json::Value>> {
        self.fresh(key).await
    }

    pub async fn peek_as<T: DeserializeOwned>(&self, key: &CacheKey) -> PipelineResult<Option<T>> {
        match self.fresh(key).await? {
            Some(value) => Ok(Some(self.decode(key, value).await?)),
            None => Ok(None),
        }
    }

    /// Write `payload` under `key` with the category TTL, replacing any
    /// existing entry.
    pub async fn put(&self, key: CacheKey, payload: serde_json::Value) -> PipelineResult<()> {
        let entry = new_entry(&*self.clock, self.ttl.ttl(key.category), key, payload);
        self.backend.store(entry).await
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn invalidate(&self, key: &CacheKey) -> PipelineResult<bool> {
        let removed = self.backend.remove(key).await?;
        tracing::debug!(key = %key, removed, "cache invalidate");
        Ok(removed)
    }

    /// Remove every category cached for `fingerprint`.
    pub async fn invalidate_fingerprint(&self, fingerprint: &Fingerprint) -> PipelineResult<usize> {
        let removed = self.backend.remove_fingerprint(fingerprint).await?;
        tracing::debug!(fingerprint = %fingerprint, removed, "cache invalidate fingerprint");
        Ok(removed)
    }

    /// Delete every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> PipelineResult<usize> {
        let removed = self.backend.purge_expired(self.clock.now()).await?;
        if removed > 0 {
            tracing::info!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }

    async fn fresh(&self, key: &CacheKey) -> PipelineResult<Option<serde_json::Value>> {
        fresh_payload(&*self.backend, &*self.clock, key).await
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
    ) -> PipelineResult<T> {
        match serde_json::from_value(value) {
            Ok(v) => Ok(v),
            Err(e) => {
                // Drop the unreadable entry so the next call recomputes.
                if let Err(err) = self.backend.remove(key).await {
                    tracing::warn!(key = %key, error = %err, "failed to drop undecodable entry");
                }
                Err(PipelineError::InvalidState {
                    reason: format!("cached payload for {} has unexpected shape: {}", key, e),
                })
            }
        }
    }
}

fn new_entry(
    clock: &dyn Clock,
    ttl: chrono::Duration,
    key: CacheKey,
    payload: serde_json::Value,
) -> CacheEntry {
    let now = clock.now();
    CacheEntry {
        key,
        payload,
        created_at: now,
        expires_at: now + ttl,
    }
}

async fn fresh_payload(
    backend: &dyn CacheBackend,
    clock: &dyn Clock,
    key: &CacheKey,
) -> PipelineResult<Option<serde_json::Value>> {
    match backend.load(key).await? {
        Some(entry) if !entry.is_expired(clock.now()) => Ok(Some(entry.payload)),
        Some(_) => {
            if let Err(e) = backend.remove(key).await {
                tracing::warn!(key = %key, error = %e, "failed to evict expired entry");
            }
            Ok(None)
        }
        None => Ok(None),
    }
}

async fn run_flight<F, Fut>(
    backend: &dyn CacheBackend,
    clock: &dyn Clock,
    ttl: chrono::Duration,
    key: &CacheKey,
    waiters: &AtomicUsize,
    compute: F,
) -> PipelineResult<serde_json::Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = PipelineResult<serde_json::Value>>,
{
    // A previous flight may have stored the value after our caller's miss.
    if let Ok(Some(payload)) = fresh_payload(backend, clock, key).await {
        return Ok(payload);
    }

    let payload = match compute().await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "cache computation failed");
            return Err(PipelineError::computation_failed(e));
        }
    };

    if waiters.load(Ordering::SeqCst) == 0 {
        tracing::debug!(key = %key, "every waiter left, discarding result");
        return Ok(payload);
    }

    let entry = new_entry(clock, ttl, key.clone(), payload.clone());
    if let Err(e) = backend.store(entry).await {
        tracing::warn!(key = %key, error = %e, "failed to store computed entry");
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use excuse_harness_core::cache::InMemoryCacheBackend;
    use excuse_harness_core::clock::ManualClock;
    use excuse_harness_core::models::ExcuseRequest;
    use excuse_harness_core::{fingerprint, ErrorKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(category: CacheCategory) -> CacheKey {
        let mut request = ExcuseRequest::new("late to standup");
        request.requested_at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        CacheKey::new(fingerprint(&request, None).unwrap(), category)
    }

    fn layer_with_clock() -> (CacheLayer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let layer = CacheLayer::new(Arc::new(InMemoryCacheBackend::new()), TtlPolicy::default())
            .with_clock(clock.clone());
        (layer, clock)
    }

    #[tokio::test]
    async fn hit_skips_compute() {
        let (layer, _) = layer_with_clock();
        let k = key(CacheCategory::GeneratedText);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            let v = layer
                .get_or_compute(k.clone(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("fresh"))
                })
                .await
                .unwrap();
            assert_eq!(v, json!("fresh"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let (layer, clock) = layer_with_clock();
        let k = key(CacheCategory::RawMaterial);
        layer.put(k.clone(), json!(1)).await.unwrap();
        clock.advance(chrono::Duration::minutes(59));
        assert_eq!(layer.peek(&k).await.unwrap(), Some(json!(1)));
        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(layer.peek(&k).await.unwrap(), None);

        let v = layer
            .get_or_compute(k.clone(), || async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(v, json!(2));
    }

    #[tokio::test]
    async fn category_ttls_differ() {
        let (layer, clock) = layer_with_clock();
        let raw = key(CacheCategory::RawMaterial);
        let evidence = key(CacheCategory::EvidenceAsset);
        layer.put(raw.clone(), json!("r")).await.unwrap();
        layer.put(evidence.clone(), json!("e")).await.unwrap();
        clock.advance(chrono::Duration::hours(2));
        assert!(layer.peek(&raw).await.unwrap().is_none());
        assert!(layer.peek(&evidence).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let (layer, _) = layer_with_clock();
        let k = key(CacheCategory::GeneratedText);
        let err = layer
            .get_or_compute(k.clone(), || async {
                Err(PipelineError::RateLimited {
                    capability: "generation".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComputationFailed);
        assert_eq!(err.root_kind(), ErrorKind::RateLimited);
        assert!(layer.peek(&k).await.unwrap().is_none());
        assert_eq!(layer.inflight_len(), 0);
    }

    #[tokio::test]
    async fn panicking_compute_leaves_no_flight_behind() {
        let (layer, _) = layer_with_clock();
        let k = key(CacheCategory::EvidenceAsset);
        let err = layer
            .get_or_compute(k.clone(), || async {
                let payload: Option<serde_json::Value> = None;
                Ok(payload.expect("adapter bug"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComputationFailed);
        assert_eq!(layer.inflight_len(), 0);

        let v = layer
            .get_or_compute(k.clone(), || async { Ok(json!("fresh")) })
            .await
            .unwrap();
        assert_eq!(v, json!("fresh"));
        assert_eq!(layer.peek(&k).await.unwrap(), Some(json!("fresh")));
    }

    #[tokio::test]
    async fn invalidate_and_purge() {
        let (layer, clock) = layer_with_clock();
        let raw = key(CacheCategory::RawMaterial);
        let text = key(CacheCategory::GeneratedText);
        layer.put(raw.clone(), json!(1)).await.unwrap();
        layer.put(text.clone(), json!(2)).await.unwrap();

        assert!(layer.invalidate(&raw).await.unwrap());
        assert!(layer.peek(&raw).await.unwrap().is_none());

        layer.put(raw.clone(), json!(1)).await.unwrap();
        assert_eq!(layer.invalidate_fingerprint(&raw.fingerprint).await.unwrap(), 2);

        layer.put(raw.clone(), json!(1)).await.unwrap();
        layer.put(text.clone(), json!(2)).await.unwrap();
        clock.advance(chrono::Duration::hours(3));
        assert_eq!(layer.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn typed_helpers_roundtrip() {
        let (layer, _) = layer_with_clock();
        let k = key(CacheCategory::GeneratedText);
        let v: Vec<String> = layer
            .get_or_compute_as(k.clone(), || async { Ok(vec!["a".to_string()]) })
            .await
            .unwrap();
        assert_eq!(v, vec!["a"]);
        let peeked: Option<Vec<String>> = layer.peek_as(&k).await.unwrap();
        assert_eq!(peeked, Some(vec!["a".to_string()]));

        let wrong: PipelineResult<Option<u64>> = layer.peek_as(&k).await;
        assert_eq!(wrong.unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(layer.peek(&k).await.unwrap().is_none());
    }
}
