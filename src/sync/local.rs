//! Local mutations
//!
//! Stamps local edits as change records, merges them through the same path
//! as remote records and hands them to the batcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::batcher::BatcherHandle;
use super::merge::Merger;
use super::roles::Role;
use super::types::{
    ChangeAction, ChangeRecord, ConflictChoice, ConflictEntry, ConflictOutcome, MergeOutcome,
};
use crate::error::SyncError;
use crate::inventory::{EntityType, InventoryRepository};

/// A mutation requested by a local user
#[derive(Debug, Clone)]
pub struct LocalMutation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub warehouse_id: String,
    pub action: ChangeAction,
    pub payload: Value,
    pub actor_id: String,
}

/// Fresh id for a new entity
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

/// Entry point for local edits
pub struct LocalChanges {
    device_id: String,
    merger: Arc<Merger>,
    batcher: BatcherHandle,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl LocalChanges {
    pub fn new(device_id: impl Into<String>, merger: Arc<Merger>, batcher: BatcherHandle) -> Self {
        Self {
            device_id: device_id.into(),
            merger,
            batcher,
            last_timestamp: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    /// Record a local mutation.
    ///
    /// The record is merged like any remote record and queued for the
    /// batcher once applied.
    pub async fn commit(&self, mutation: LocalMutation) -> Result<ChangeRecord, SyncError> {
        let repo = InventoryRepository::new(self.merger.pool());

        if mutation.entity_type != EntityType::Warehouse {
            let live = repo
                .get_entity(&mutation.warehouse_id)
                .await
                .map_err(SyncError::storage)?
                .is_some_and(|w| w.entity_type == EntityType::Warehouse && !w.deleted);
            if !live {
                return Err(SyncError::NotFound(format!("warehouse {}", mutation.warehouse_id)));
            }
        }

        let local_seq = repo.next_local_seq().await.map_err(SyncError::storage)?;
        let base_change_id = repo
            .get_entity(&mutation.entity_id)
            .await
            .map_err(SyncError::storage)?
            .map(|e| e.last_change_id);

        let actor_role_weight = self
            .merger
            .oracle()
            .priority(&mutation.actor_id, &mutation.warehouse_id)
            .unwrap_or_else(|| Role::Guest.weight());

        let record = ChangeRecord {
            id: Uuid::new_v4().to_string(),
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id,
            action: mutation.action,
            payload: mutation.payload,
            actor_id: mutation.actor_id,
            actor_role_weight,
            origin_device_id: self.device_id.clone(),
            warehouse_id: mutation.warehouse_id,
            timestamp: self.next_timestamp(),
            local_seq,
            base_change_id,
        };

        let report = self.merger.apply(&record).await?;
        match report.outcome {
            MergeOutcome::Applied => {
                self.batcher.enqueue(record.clone());
                Ok(record)
            }
            MergeOutcome::NotFound => Err(SyncError::NotFound(format!(
                "{} {} in warehouse {}",
                record.entity_type.as_str(),
                record.entity_id,
                record.warehouse_id
            ))),
            other => Err(SyncError::StaleData(format!(
                "local change {} was {}",
                record.id,
                other.as_str()
            ))),
        }
    }

    /// Settle a pending conflict.
    ///
    /// The chosen side is written as a new local change so that peers
    /// converge on it through the normal merge rules.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ConflictChoice,
        actor_id: &str,
    ) -> Result<ChangeRecord, SyncError> {
        let repo = InventoryRepository::new(self.merger.pool());
        let entry: ConflictEntry = repo
            .get_conflict(conflict_id)
            .await
            .map_err(SyncError::storage)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;

        if entry.outcome != ConflictOutcome::Pending {
            return Err(SyncError::Conflict(format!("{} is already resolved", conflict_id)));
        }

        let chosen = match choice {
            ConflictChoice::KeepLocal => &entry.local,
            ConflictChoice::AcceptRemote => &entry.remote,
        };
        // Re-asserting a creation is an update of the existing entity
        let action = match chosen.action {
            ChangeAction::Create => ChangeAction::Update,
            other => other,
        };

        let record = self
            .commit(LocalMutation {
                entity_type: entry.entity_type,
                entity_id: entry.entity_id.clone(),
                warehouse_id: chosen.warehouse_id.clone(),
                action,
                payload: chosen.payload.clone(),
                actor_id: actor_id.to_string(),
            })
            .await?;

        let outcome = match choice {
            ConflictChoice::KeepLocal => ConflictOutcome::KeptLocal,
            ConflictChoice::AcceptRemote => ConflictOutcome::AcceptedRemote,
        };
        repo.settle_conflict(conflict_id, outcome)
            .await
            .map_err(SyncError::storage)?;

        tracing::info!(
            conflict_id = %conflict_id,
            outcome = outcome.as_str(),
            change_id = %record.id,
            "Conflict resolved"
        );

        Ok(record)
    }

    /// Wall clock, nudged forward so local records never go backwards
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock();
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::create_memory_pool;
    use crate::stats::SyncStats;
    use crate::sync::batcher::{BatchSink, ChangeBatcher, Delivery, OutboundBatch};
    use crate::sync::roles::WarehouseRoles;
    use async_trait::async_trait;
    use serde_json::json;

    struct Offline;

    #[async_trait]
    impl BatchSink for Offline {
        async fn deliver(&self, _batch: &OutboundBatch) -> Result<Delivery, SyncError> {
            Ok(Delivery::default())
        }
    }

    async fn setup() -> (LocalChanges, BatcherHandle, Arc<WarehouseRoles>) {
        let pool = create_memory_pool().await.unwrap();
        let roles = Arc::new(WarehouseRoles::new());
        let stats = Arc::new(SyncStats::new());
        let merger = Arc::new(Merger::new(pool, roles.clone(), stats.clone()));
        let (batcher, _task) = ChangeBatcher::spawn(Arc::new(Offline), &SyncConfig::default(), stats);
        (LocalChanges::new("device-a", merger, batcher.clone()), batcher, roles)
    }

    fn create_warehouse(id: &str) -> LocalMutation {
        LocalMutation {
            entity_type: EntityType::Warehouse,
            entity_id: id.to_string(),
            warehouse_id: id.to_string(),
            action: ChangeAction::Create,
            payload: json!({ "name": "Garage", "public": true }),
            actor_id: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_stamps_sequence_and_base() {
        let (local, _batcher, roles) = setup().await;
        roles.assign("wh-1", "alice", Role::Owner);

        let created = local.commit(create_warehouse("wh-1")).await.unwrap();
        assert_eq!(created.origin_device_id, "device-a");
        assert_eq!(created.actor_role_weight, 1000);
        assert_eq!(created.base_change_id, None);

        let mut rename = create_warehouse("wh-1");
        rename.action = ChangeAction::Update;
        rename.payload = json!({ "name": "Shed", "public": true });
        let updated = local.commit(rename).await.unwrap();

        assert!(updated.local_seq > created.local_seq);
        assert!(updated.timestamp > created.timestamp);
        assert_eq!(updated.base_change_id.as_deref(), Some(created.id.as_str()));
    }

    #[tokio::test]
    async fn test_commit_into_unknown_warehouse_fails() {
        let (local, _batcher, _roles) = setup().await;

        let result = local
            .commit(LocalMutation {
                entity_type: EntityType::Room,
                entity_id: new_entity_id(),
                warehouse_id: "wh-missing".to_string(),
                action: ChangeAction::Create,
                payload: json!({ "name": "Attic" }),
                actor_id: "alice".to_string(),
            })
            .await;

        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unassigned_actor_gets_guest_weight() {
        let (local, _batcher, _roles) = setup().await;

        let created = local.commit(create_warehouse("wh-1")).await.unwrap();
        assert_eq!(created.actor_role_weight, Role::Guest.weight());
    }

    #[tokio::test]
    async fn test_committed_records_reach_the_batcher() {
        let (local, batcher, _roles) = setup().await;

        local.commit(create_warehouse("wh-1")).await.unwrap();
        batcher.flush_now().await;

        assert_eq!(batcher.offline_len(), 1);
    }

    #[tokio::test]
    async fn test_accepting_remote_delete_tombstones_entity() {
        let (local, _batcher, _roles) = setup().await;
        local.commit(create_warehouse("wh-1")).await.unwrap();

        let item = local
            .commit(LocalMutation {
                entity_type: EntityType::Item,
                entity_id: "item-x".to_string(),
                warehouse_id: "wh-1".to_string(),
                action: ChangeAction::Create,
                payload: json!({ "name": "Drill" }),
                actor_id: "alice".to_string(),
            })
            .await
            .unwrap();
        local
            .commit(LocalMutation {
                entity_type: EntityType::Item,
                entity_id: "item-x".to_string(),
                warehouse_id: "wh-1".to_string(),
                action: ChangeAction::Update,
                payload: json!({ "name": "Cordless drill" }),
                actor_id: "alice".to_string(),
            })
            .await
            .unwrap();

        // Deleted on another device that had only seen the creation
        let remote_delete = ChangeRecord {
            id: "remote-delete".to_string(),
            action: ChangeAction::Delete,
            origin_device_id: "device-b".to_string(),
            actor_id: "bob".to_string(),
            local_seq: 1,
            base_change_id: Some(item.id.clone()),
            timestamp: Utc::now(),
            ..item.clone()
        };
        let report = local.merger.apply(&remote_delete).await.unwrap();
        assert_eq!(report.outcome, MergeOutcome::ConflictRecorded);
        let conflict = report.conflict.unwrap();

        local
            .resolve_conflict(&conflict.id, ConflictChoice::AcceptRemote, "alice")
            .await
            .unwrap();

        let repo = InventoryRepository::new(local.merger.pool());
        assert!(repo.get_entity("item-x").await.unwrap().unwrap().deleted);
        assert!(local.merger.pending_conflicts().await.unwrap().is_empty());

        let again = local
            .resolve_conflict(&conflict.id, ConflictChoice::KeepLocal, "alice")
            .await;
        assert!(matches!(again, Err(SyncError::Conflict(_))));
    }
}
