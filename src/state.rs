//! Application state management

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::discovery::DeviceRegistry;
use crate::error::SyncError;
use crate::stats::SyncStats;
use crate::sync::{
    BatcherHandle, ChangeBatcher, CheckpointBook, LocalChanges, Merger, SyncClient,
    WarehouseRoles,
};

/// How many recent push batch ids are remembered
const SEEN_BATCHES: usize = 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    /// Port the HTTP server actually bound
    port: u16,
    registry: DeviceRegistry,
    roles: Arc<WarehouseRoles>,
    stats: Arc<SyncStats>,
    merger: Arc<Merger>,
    client: Arc<SyncClient>,
    batcher: BatcherHandle,
    local: Arc<LocalChanges>,
    seen_batches: Mutex<LruCache<String, ()>>,
}

impl AppState {
    /// Wire up the sync engine and start the batcher task
    pub async fn new(config: Config, db: SqlitePool, port: u16) -> Result<Self, SyncError> {
        let registry = DeviceRegistry::new(config.device.id.clone());
        let roles = Arc::new(WarehouseRoles::new());
        let stats = Arc::new(SyncStats::new());

        let merger = Arc::new(Merger::new(db.clone(), roles.clone(), stats.clone()));
        let checkpoints = CheckpointBook::load(db.clone()).await?;
        let client = Arc::new(SyncClient::new(
            &config,
            merger.clone(),
            registry.clone(),
            checkpoints,
            stats.clone(),
        )?);

        let (batcher, _task) = ChangeBatcher::spawn(client.clone(), &config.sync, stats.clone());
        let local = Arc::new(LocalChanges::new(
            config.device.id.clone(),
            merger.clone(),
            batcher.clone(),
        ));

        let capacity = NonZeroUsize::new(SEEN_BATCHES).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                port,
                registry,
                roles,
                stats,
                merger,
                client,
                batcher,
                local,
                seen_batches: Mutex::new(LruCache::new(capacity)),
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn device_id(&self) -> &str {
        &self.inner.config.device.id
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Per-warehouse role map used for tie-breaks
    pub fn roles(&self) -> &WarehouseRoles {
        &self.inner.roles
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.inner.stats
    }

    pub fn merger(&self) -> &Merger {
        &self.inner.merger
    }

    pub fn client(&self) -> &Arc<SyncClient> {
        &self.inner.client
    }

    pub fn batcher(&self) -> &BatcherHandle {
        &self.inner.batcher
    }

    /// Entry point for local edits
    pub fn local(&self) -> &LocalChanges {
        &self.inner.local
    }

    /// Remember a push batch id; returns true if it was seen before
    pub fn note_batch(&self, batch_id: &str) -> bool {
        let mut seen = self.inner.seen_batches.lock();
        seen.put(batch_id.to_string(), ()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;

    #[tokio::test]
    async fn test_batch_ids_are_recognised_on_retry() {
        let pool = create_memory_pool().await.unwrap();
        let state = AppState::new(Config::default(), pool, 8765).await.unwrap();

        assert!(!state.note_batch("batch-1"));
        assert!(state.note_batch("batch-1"));
        assert!(!state.note_batch("batch-2"));
    }
}
