//! Per-peer sync checkpoints
//!
//! A checkpoint holds two boundaries for one peer:
//! - `last_exchanged`, on the peer's clock, bounds what we pull
//! - `last_pushed`, on our clock, bounds what we push
//!
//! Both only move forward, and only after a session fully succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::inventory::InventoryRepository;

/// Sync boundary for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub peer_id: String,
    /// The peer's `syncTimestamp` from the last completed pull
    pub last_exchanged: DateTime<Utc>,
    /// Local time at the start of the last completed push
    pub last_pushed: DateTime<Utc>,
}

impl SyncCheckpoint {
    /// Merge with another checkpoint for the same peer, keeping the later
    /// boundary on each side
    fn max(&self, other: &SyncCheckpoint) -> SyncCheckpoint {
        SyncCheckpoint {
            peer_id: self.peer_id.clone(),
            last_exchanged: self.last_exchanged.max(other.last_exchanged),
            last_pushed: self.last_pushed.max(other.last_pushed),
        }
    }
}

// ============================================================================
// Checkpoint Book
// ============================================================================

/// Cached, persisted checkpoints for every peer we have synced with
#[derive(Clone)]
pub struct CheckpointBook {
    inner: Arc<CheckpointBookInner>,
}

struct CheckpointBookInner {
    pool: SqlitePool,
    checkpoints: RwLock<HashMap<String, SyncCheckpoint>>,
}

impl CheckpointBook {
    /// Load persisted checkpoints
    pub async fn load(pool: SqlitePool) -> Result<Self, SyncError> {
        let stored = InventoryRepository::new(&pool)
            .load_checkpoints()
            .await
            .map_err(SyncError::storage)?;

        let checkpoints = stored
            .into_iter()
            .map(|c| (c.peer_id.clone(), c))
            .collect::<HashMap<_, _>>();

        tracing::debug!(peers = checkpoints.len(), "Loaded sync checkpoints");

        Ok(Self {
            inner: Arc::new(CheckpointBookInner {
                pool,
                checkpoints: RwLock::new(checkpoints),
            }),
        })
    }

    /// Current checkpoint for a peer; `None` means sync everything
    pub async fn get(&self, peer_id: &str) -> Option<SyncCheckpoint> {
        self.inner.checkpoints.read().await.get(peer_id).cloned()
    }

    /// Advance a peer's checkpoint. Boundaries that would move backwards
    /// are kept at their current value.
    pub async fn advance(&self, checkpoint: SyncCheckpoint) -> Result<SyncCheckpoint, SyncError> {
        let mut checkpoints = self.inner.checkpoints.write().await;

        let next = match checkpoints.get(&checkpoint.peer_id) {
            Some(current) => current.max(&checkpoint),
            None => checkpoint,
        };

        InventoryRepository::new(&self.inner.pool)
            .save_checkpoint(&next)
            .await
            .map_err(SyncError::storage)?;

        checkpoints.insert(next.peer_id.clone(), next.clone());

        tracing::debug!(
            peer_id = %next.peer_id,
            last_exchanged = %next.last_exchanged,
            last_pushed = %next.last_pushed,
            "Advanced sync checkpoint"
        );

        Ok(next)
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.checkpoints.read().await.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
