//! Cache backend abstraction and the in-memory backend.
//!
//! A [`CacheBackend`] is plain key-value storage for [`CacheEntry`] values
//! keyed by [`CacheKey`]. It knows nothing about TTL policy or
//! single-flight; those live in the app crate's cache layer, which owns the
//! clock and decides expiry. Backends only compare `expires_at` against the
//! `now` they are given.
//!
//! Entries are replaced whole; there are no partial updates.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;
use crate::models::CacheCategory;

/// `(fingerprint, category)` pair identifying one cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub category: CacheCategory,
}

impl CacheKey {
    pub fn new(fingerprint: Fingerprint, category: CacheCategory) -> Self {
        Self {
            fingerprint,
            category,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category.as_str(), self.fingerprint)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is expired from `expires_at` onwards.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage for cache entries.
///
/// Failures are reported as [`PipelineError::CacheUnavailable`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch the stored entry for `key`, expired or not.
    async fn load(&self, key: &CacheKey) -> PipelineResult<Option<CacheEntry>>;

    /// Insert or replace the entry for `entry.key`.
    async fn store(&self, entry: CacheEntry) -> PipelineResult<()>;

    /// Remove one entry. Returns whether anything was removed.
    async fn remove(&self, key: &CacheKey) -> PipelineResult<bool>;

    /// Remove every category stored for `fingerprint`. Returns the count.
    async fn remove_fingerprint(&self, fingerprint: &Fingerprint) -> PipelineResult<usize>;

    /// Remove entries expired at `now`. Returns the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> PipelineResult<usize>;

    /// Number of stored entries, expired ones included.
    async fn len(&self) -> PipelineResult<usize>;
}

/// `HashMap` backend behind `std::sync::RwLock`.
#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PipelineResult<RwLockReadGuard<'_, HashMap<CacheKey, CacheEntry>>> {
        self.entries
            .read()
            .map_err(|_| PipelineError::cache_unavailable("cache lock poisoned"))
    }

    fn write(&self) -> PipelineResult<RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>>> {
        self.entries
            .write()
            .map_err(|_| PipelineError::cache_unavailable("cache lock poisoned"))
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn load(&self, key: &CacheKey) -> PipelineResult<Option<CacheEntry>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn store(&self, entry: CacheEntry) -> PipelineResult<()> {
        self.write()?.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> PipelineResult<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn remove_fingerprint(&self, fingerprint: &Fingerprint) -> PipelineResult<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|k, _| &k.fingerprint != fingerprint);
        Ok(before - entries.len())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }

    async fn len(&self) -> PipelineResult<usize> {
        Ok(self.read()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::models::ExcuseRequest;
    use chrono::{Duration, TimeZone};

    fn key(situation: &str, category: CacheCategory) -> CacheKey {
        let mut request = ExcuseRequest::new(situation);
        request.requested_at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        CacheKey::new(fingerprint(&request, None).unwrap(), category)
    }

    fn entry(key: CacheKey, ttl_secs: i64) -> CacheEntry {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        CacheEntry {
            key,
            payload: serde_json::json!({"ok": true}),
            created_at: created,
            expires_at: created + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let e = entry(key("late", CacheCategory::RawMaterial), 60);
        assert!(!e.is_expired(e.expires_at - Duration::seconds(1)));
        assert!(e.is_expired(e.expires_at));
    }

    #[tokio::test]
    async fn store_load_remove() {
        let backend = InMemoryCacheBackend::new();
        let k = key("late", CacheCategory::GeneratedText);
        backend.store(entry(k.clone(), 60)).await.unwrap();
        assert!(backend.load(&k).await.unwrap().is_some());
        assert!(backend.remove(&k).await.unwrap());
        assert!(!backend.remove(&k).await.unwrap());
        assert!(backend.load(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_fingerprint_clears_all_categories() {
        let backend = InMemoryCacheBackend::new();
        let raw = key("late", CacheCategory::RawMaterial);
        let text = CacheKey::new(raw.fingerprint.clone(), CacheCategory::GeneratedText);
        let other = key("sick", CacheCategory::RawMaterial);
        for k in [raw.clone(), text, other.clone()] {
            backend.store(entry(k, 60)).await.unwrap();
        }
        assert_eq!(backend.remove_fingerprint(&raw.fingerprint).await.unwrap(), 2);
        assert_eq!(backend.len().await.unwrap(), 1);
        assert!(backend.load(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_expired_counts_removed() {
        let backend = InMemoryCacheBackend::new();
        let short = entry(key("a", CacheCategory::RawMaterial), 10);
        let long = entry(key("b", CacheCategory::EvidenceAsset), 1000);
        let now = short.expires_at;
        backend.store(short).await.unwrap();
        backend.store(long).await.unwrap();
        assert_eq!(backend.purge_expired(now).await.unwrap(), 1);
        assert_eq!(backend.len().await.unwrap(), 1);
    }
}
