//! Construction and lifecycle of the shared stores.
//!
//! [`Stores`] owns the Cache Layer and Vector Memory handles that every
//! run shares. They are opened once, passed to the [`Orchestrator`], and
//! closed explicitly. `[cache] backend` and `[memory] backend` pick
//! SQLite (default) or in-process storage independently.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use excuse_harness_core::cache::{CacheBackend, InMemoryCacheBackend};
use excuse_harness_core::memory::{InMemoryVectorMemory, VectorMemory};

use crate::cache::{CacheLayer, TtlPolicy};
use crate::capabilities::Capabilities;
use crate::config::{BackendKind, Config};
use crate::memory_store::SqliteVectorMemory;
use crate::orchestrator::{Orchestrator, PipelineSettings};
use crate::sqlite_cache::SqliteCacheBackend;
use crate::{db, migrate};

pub struct Stores {
    pub cache: Arc<CacheLayer>,
    pub memory: Arc<dyn VectorMemory>,
    pool: Option<SqlitePool>,
}

impl Stores {
    /// Open the configured backends, applying migrations when SQLite is used.
    pub async fn open(config: &Config) -> Result<Self> {
        let needs_db =
            config.cache.backend == BackendKind::Sqlite || config.memory.backend == BackendKind::Sqlite;
        let pool = if needs_db {
            let pool = db::connect(config).await?;
            migrate::apply(&pool).await?;
            Some(pool)
        } else {
            None
        };

        let cache_backend: Arc<dyn CacheBackend> = match (&pool, config.cache.backend) {
            (Some(pool), BackendKind::Sqlite) => Arc::new(SqliteCacheBackend::new(pool.clone())),
            _ => Arc::new(InMemoryCacheBackend::new()),
        };
        let memory: Arc<dyn VectorMemory> = match (&pool, config.memory.backend) {
            (Some(pool), BackendKind::Sqlite) => Arc::new(SqliteVectorMemory::new(pool.clone())),
            _ => Arc::new(InMemoryVectorMemory::new()),
        };

        tracing::debug!(
            cache = ?config.cache.backend,
            memory = ?config.memory.backend,
            "stores opened"
        );
        Ok(Self {
            cache: Arc::new(CacheLayer::new(cache_backend, TtlPolicy::from_config(&config.cache))),
            memory,
            pool,
        })
    }

    /// Purely in-process stores with default TTLs.
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(CacheLayer::new(
                Arc::new(InMemoryCacheBackend::new()),
                TtlPolicy::default(),
            )),
            memory: Arc::new(InMemoryVectorMemory::new()),
            pool: None,
        }
    }

    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}

/// Open stores and capabilities from `config` and wire an orchestrator.
pub async fn build_orchestrator(config: &Config) -> Result<(Orchestrator, Stores)> {
    let stores = Stores::open(config).await?;
    let capabilities = Capabilities::from_config(config)?;
    let orchestrator = Orchestrator::new(
        PipelineSettings::from_config(config),
        stores.cache.clone(),
        stores.memory.clone(),
        capabilities,
    );
    Ok((orchestrator, stores))
}
