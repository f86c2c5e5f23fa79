//! Merge path for change records
//!
//! Every record, whether created locally or received from a peer, goes
//! through [`Merger::apply`]. Merges for the same entity are serialized;
//! each decision is committed in a single transaction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use sqlx::SqlitePool;

use super::conflict::{ConflictResolver, Resolution};
use super::roles::RolePriorityOracle;
use super::types::{ChangeAction, ChangeRecord, ConflictEntry, MergeOutcome, RecordResult};
use crate::error::SyncError;
use crate::inventory::{
    ChangeStatus, Entity, EntityEffect, EntityType, InventoryRepository, MergeCommit,
};
use crate::stats::SyncStats;

/// Lock table entries are pruned once the table grows past this size
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Result of merging one record
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub conflict: Option<ConflictEntry>,
}

impl MergeReport {
    fn outcome(outcome: MergeOutcome) -> Self {
        Self {
            outcome,
            conflict: None,
        }
    }
}

/// Per-entity async locks
#[derive(Default)]
struct EntityLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    fn lock_for(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// What to do with a record after comparing it with local state
enum Decision {
    Apply(EntityEffect),
    Stale,
    Conflict(ConflictEntry),
    NotFound,
}

/// Merges change records into the local store
pub struct Merger {
    pool: SqlitePool,
    oracle: Arc<dyn RolePriorityOracle>,
    stats: Arc<SyncStats>,
    locks: EntityLocks,
}

impl Merger {
    pub fn new(pool: SqlitePool, oracle: Arc<dyn RolePriorityOracle>, stats: Arc<SyncStats>) -> Self {
        Self {
            pool,
            oracle,
            stats,
            locks: EntityLocks::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn oracle(&self) -> &dyn RolePriorityOracle {
        self.oracle.as_ref()
    }

    /// Merge a single record into local state
    pub async fn apply(&self, record: &ChangeRecord) -> Result<MergeReport, SyncError> {
        record.validate().map_err(SyncError::MalformedMessage)?;

        let lock = self.locks.lock_for(&record.entity_id);
        let _guard = lock.lock().await;

        let report = self.apply_locked(record).await?;
        self.stats.record_outcome(report.outcome);

        tracing::debug!(
            change_id = %record.id,
            entity_id = %record.entity_id,
            action = record.action.as_str(),
            origin = %record.origin_device_id,
            outcome = report.outcome.as_str(),
            "Merged change record"
        );
        if let Some(conflict) = &report.conflict {
            tracing::warn!(
                conflict_id = %conflict.id,
                entity_id = %conflict.entity_id,
                "Conflict recorded for manual review"
            );
        }

        Ok(report)
    }

    async fn apply_locked(&self, record: &ChangeRecord) -> Result<MergeReport, SyncError> {
        let repo = InventoryRepository::new(&self.pool);

        if repo.is_known_change(&record.id).await.map_err(SyncError::storage)? {
            return Ok(MergeReport::outcome(MergeOutcome::AlreadyApplied));
        }

        let mut scope_deleted = false;
        if record.entity_type != EntityType::Warehouse {
            match repo
                .get_entity(&record.warehouse_id)
                .await
                .map_err(SyncError::storage)?
            {
                Some(w) if w.entity_type == EntityType::Warehouse => scope_deleted = w.deleted,
                _ => return Ok(MergeReport::outcome(MergeOutcome::NotFound)),
            }
        }

        let current = repo.get_entity(&record.entity_id).await.map_err(SyncError::storage)?;
        if let Some(entity) = &current {
            if entity.entity_type != record.entity_type {
                return Err(SyncError::MalformedMessage(format!(
                    "record {} targets {} {} as a {}",
                    record.id,
                    entity.entity_type.as_str(),
                    entity.id,
                    record.entity_type.as_str()
                )));
            }
        }

        let decision = match current {
            // Edits inside a deleted warehouse are logged but have no effect
            _ if scope_deleted => Decision::Stale,
            None => match record.action {
                ChangeAction::Create => Decision::Apply(EntityEffect::Write),
                ChangeAction::Update | ChangeAction::Delete => Decision::NotFound,
            },
            Some(entity) => self.decide(&repo, &entity, record).await?,
        };

        let (status, effect, conflict, outcome) = match decision {
            Decision::NotFound => return Ok(MergeReport::outcome(MergeOutcome::NotFound)),
            Decision::Apply(effect) => (ChangeStatus::Applied, effect, None, MergeOutcome::Applied),
            Decision::Stale => (ChangeStatus::Stale, EntityEffect::None, None, MergeOutcome::IgnoredStale),
            Decision::Conflict(entry) => (
                ChangeStatus::Conflict,
                EntityEffect::None,
                Some(entry),
                MergeOutcome::ConflictRecorded,
            ),
        };

        let written = repo
            .commit(MergeCommit {
                record,
                status,
                effect,
                conflict: conflict.as_ref(),
            })
            .await
            .map_err(SyncError::storage)?;

        if !written {
            return Ok(MergeReport::outcome(MergeOutcome::AlreadyApplied));
        }

        Ok(MergeReport { outcome, conflict })
    }

    /// Compare an incoming record with an existing entity
    async fn decide(
        &self,
        repo: &InventoryRepository<'_>,
        entity: &Entity,
        record: &ChangeRecord,
    ) -> Result<Decision, SyncError> {
        let same_origin = record.origin_device_id == entity.last_origin_device_id;
        if same_origin && record.local_seq <= entity.last_local_seq {
            return Ok(Decision::Stale);
        }

        match record.base_change_id.as_deref() {
            Some(base) if base == entity.last_change_id => {
                return Ok(Decision::Apply(EntityEffect::for_action(record.action)));
            }
            Some(base) => {
                // Built on a change this store has not seen yet; applying it
                // now would order it before that change
                if !repo.is_known_change(base).await.map_err(SyncError::storage)? {
                    return Ok(Decision::NotFound);
                }
            }
            None if same_origin => {
                return Ok(Decision::Apply(EntityEffect::for_action(record.action)));
            }
            None => {}
        }

        let Some(local) = repo
            .get_change(&entity.last_change_id)
            .await
            .map_err(SyncError::storage)?
        else {
            // No record of how the entity got here; treat the edit as a
            // plain successor
            return Ok(Decision::Apply(EntityEffect::for_action(record.action)));
        };

        let resolver = ConflictResolver::new(self.oracle.as_ref());
        Ok(match resolver.resolve(&local, record) {
            Resolution::KeepBoth | Resolution::KeepLocal(_) => Decision::Stale,
            Resolution::AcceptIncoming(_) => Decision::Apply(EntityEffect::for_action(record.action)),
            Resolution::Conflict(entry) => Decision::Conflict(entry),
        })
    }

    /// Merge a batch in `(timestamp, localSeq)` order.
    ///
    /// Records that found no parent or base change are replayed again after
    /// the pass, as long as the previous pass settled something; clock skew
    /// between devices can sort a child before its parent. A failure on one
    /// record is reported for that record only.
    pub async fn apply_batch(
        &self,
        mut records: Vec<ChangeRecord>,
    ) -> (Vec<RecordResult>, Vec<ConflictEntry>) {
        ChangeRecord::sort_for_replay(&mut records);

        let mut results: Vec<Option<RecordResult>> = vec![None; records.len()];
        let mut conflicts = Vec::new();
        let mut waiting: Vec<usize> = (0..records.len()).collect();

        while !waiting.is_empty() {
            let mut unplaced = Vec::new();

            for &i in &waiting {
                let record = &records[i];
                let result = match self.apply(record).await {
                    Ok(report) => {
                        conflicts.extend(report.conflict);
                        RecordResult::new(&record.id, report.outcome)
                    }
                    Err(e) => {
                        tracing::warn!(change_id = %record.id, error = %e, "Failed to merge record");
                        self.stats.record_outcome(MergeOutcome::Rejected);
                        RecordResult::rejected(&record.id, e.to_string())
                    }
                };
                if result.outcome == MergeOutcome::NotFound {
                    unplaced.push(i);
                }
                results[i] = Some(result);
            }

            if unplaced.len() == waiting.len() {
                break;
            }
            waiting = unplaced;
        }

        (results.into_iter().flatten().collect(), conflicts)
    }

    /// Parse raw JSON records and merge the valid ones.
    ///
    /// `expected` rejects records whose entity type does not match the
    /// endpoint they were pushed to.
    pub async fn apply_raw_batch(
        &self,
        raw: Vec<Value>,
        expected: Option<EntityType>,
    ) -> (Vec<RecordResult>, Vec<ConflictEntry>) {
        let mut rejected = Vec::new();
        let mut valid = Vec::with_capacity(raw.len());

        for value in raw {
            let id = value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            match serde_json::from_value::<ChangeRecord>(value) {
                Ok(record) => match expected {
                    Some(t) if t != record.entity_type => {
                        rejected.push(RecordResult::rejected(
                            id,
                            format!(
                                "{} record sent to /{}",
                                record.entity_type.as_str(),
                                t.collection()
                            ),
                        ));
                    }
                    _ => valid.push(record),
                },
                Err(e) => {
                    tracing::debug!(change_id = %id, error = %e, "Dropping malformed record");
                    rejected.push(RecordResult::rejected(id, format!("malformed record: {}", e)));
                }
            }
        }

        for _ in &rejected {
            self.stats.record_outcome(MergeOutcome::Rejected);
        }

        let (mut results, conflicts) = self.apply_batch(valid).await;
        rejected.append(&mut results);
        (rejected, conflicts)
    }

    /// Conflicts still awaiting review
    pub async fn pending_conflicts(&self) -> Result<Vec<ConflictEntry>, SyncError> {
        InventoryRepository::new(&self.pool)
            .list_conflicts(true)
            .await
            .map_err(SyncError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use crate::sync::roles::WarehouseRoles;
    use chrono::DateTime;
    use serde_json::json;

    async fn merger() -> Merger {
        let pool = create_memory_pool().await.unwrap();
        Merger::new(pool, Arc::new(WarehouseRoles::new()), Arc::new(SyncStats::new()))
    }

    fn change(
        id: &str,
        entity_type: EntityType,
        entity_id: &str,
        action: ChangeAction,
        device: &str,
        seq: u64,
        ts: i64,
    ) -> ChangeRecord {
        ChangeRecord {
            id: id.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            action,
            payload: json!({ "name": id }),
            actor_id: format!("actor-{}", device),
            actor_role_weight: 700,
            origin_device_id: device.to_string(),
            warehouse_id: "wh-1".to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            local_seq: seq,
            base_change_id: None,
        }
    }

    async fn seed(merger: &Merger) -> ChangeRecord {
        let warehouse = change("c-wh", EntityType::Warehouse, "wh-1", ChangeAction::Create, "a", 1, 10);
        merger.apply(&warehouse).await.unwrap();
        let item = change("c-item", EntityType::Item, "item-x", ChangeAction::Create, "a", 2, 20);
        merger.apply(&item).await.unwrap();
        item
    }

    fn edit(id: &str, device: &str, weight: i64, ts: i64, base: &str, text: &str) -> ChangeRecord {
        let mut r = change(id, EntityType::Item, "item-x", ChangeAction::Update, device, 10, ts);
        r.actor_role_weight = weight;
        r.base_change_id = Some(base.to_string());
        r.payload = json!({ "description": text });
        r
    }

    async fn description(merger: &Merger) -> Value {
        let entity = InventoryRepository::new(merger.pool())
            .get_entity("item-x")
            .await
            .unwrap()
            .unwrap();
        entity.data["description"].clone()
    }

    #[tokio::test]
    async fn test_second_application_reports_already_applied() {
        let merger = merger().await;
        let item = seed(&merger).await;

        let report = merger.apply(&item).await.unwrap();
        assert_eq!(report.outcome, MergeOutcome::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_unknown_warehouse_is_not_found() {
        let merger = merger().await;
        let mut item = change("c1", EntityType::Item, "item-1", ChangeAction::Create, "a", 1, 10);
        item.warehouse_id = "wh-missing".to_string();

        let report = merger.apply(&item).await.unwrap();
        assert_eq!(report.outcome, MergeOutcome::NotFound);
        assert_eq!(
            InventoryRepository::new(merger.pool()).change_count().await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_concurrent_creates_commute() {
        for flip in [false, true] {
            let merger = merger().await;
            seed(&merger).await;

            let a = change("ca", EntityType::Item, "item-a", ChangeAction::Create, "a", 5, 50);
            let b = change("cb", EntityType::Item, "item-b", ChangeAction::Create, "b", 5, 50);
            let order = if flip { vec![b, a] } else { vec![a, b] };
            for record in &order {
                assert_eq!(merger.apply(record).await.unwrap().outcome, MergeOutcome::Applied);
            }

            let entities = InventoryRepository::new(merger.pool())
                .list_entities("wh-1")
                .await
                .unwrap();
            let ids: Vec<_> = entities.iter().map(|e| e.id.as_str()).collect();
            assert!(ids.contains(&"item-a") && ids.contains(&"item-b"));
        }
    }

    #[tokio::test]
    async fn test_priority_wins_in_either_arrival_order() {
        for flip in [false, true] {
            let merger = merger().await;
            seed(&merger).await;

            let from_a = edit("u-a", "a", 1000, 100, "c-item", "A");
            let from_b = edit("u-b", "b", 700, 101, "c-item", "B");
            let order = if flip { [&from_b, &from_a] } else { [&from_a, &from_b] };
            for record in order {
                merger.apply(record).await.unwrap();
            }

            assert_eq!(description(&merger).await, json!("A"));
        }
    }

    #[tokio::test]
    async fn test_delete_concurrent_with_update_records_conflict() {
        let merger = merger().await;
        seed(&merger).await;

        let update = edit("u-b", "b", 700, 100, "c-item", "B");
        let mut delete = change("d-c", EntityType::Item, "item-x", ChangeAction::Delete, "c", 1, 101);
        delete.base_change_id = Some("c-item".to_string());
        delete.actor_role_weight = 1000;

        merger.apply(&update).await.unwrap();
        let report = merger.apply(&delete).await.unwrap();

        assert_eq!(report.outcome, MergeOutcome::ConflictRecorded);
        let entity = InventoryRepository::new(merger.pool())
            .get_entity("item-x")
            .await
            .unwrap()
            .unwrap();
        assert!(!entity.deleted);
        assert_eq!(merger.pending_conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_delete_applies() {
        let merger = merger().await;
        seed(&merger).await;

        let mut delete = change("d-b", EntityType::Item, "item-x", ChangeAction::Delete, "b", 1, 100);
        delete.base_change_id = Some("c-item".to_string());

        assert_eq!(merger.apply(&delete).await.unwrap().outcome, MergeOutcome::Applied);
        let entity = InventoryRepository::new(merger.pool())
            .get_entity("item-x")
            .await
            .unwrap()
            .unwrap();
        assert!(entity.deleted);
    }

    #[tokio::test]
    async fn test_older_record_from_same_device_is_stale() {
        let merger = merger().await;
        seed(&merger).await;

        let mut newer = edit("u-2", "a", 700, 200, "c-item", "second");
        newer.local_seq = 4;
        let mut older = edit("u-1", "a", 700, 150, "c-item", "first");
        older.local_seq = 3;

        merger.apply(&newer).await.unwrap();
        let report = merger.apply(&older).await.unwrap();

        assert_eq!(report.outcome, MergeOutcome::IgnoredStale);
        assert_eq!(description(&merger).await, json!("second"));
    }

    #[tokio::test]
    async fn test_batch_is_replayed_in_order_and_isolates_bad_records() {
        let merger = merger().await;

        let warehouse = change("c-wh", EntityType::Warehouse, "wh-1", ChangeAction::Create, "a", 1, 10);
        let room = change("c-room", EntityType::Room, "room-1", ChangeAction::Create, "a", 2, 11);
        let raw = vec![
            serde_json::to_value(&room).unwrap(),
            json!({ "id": "broken", "entityType": "item" }),
            serde_json::to_value(&warehouse).unwrap(),
        ];

        let (results, conflicts) = merger.apply_raw_batch(raw, None).await;
        assert!(conflicts.is_empty());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "broken");
        assert_eq!(results[0].outcome, MergeOutcome::Rejected);
        assert_eq!(results[1].id, "c-wh");
        assert_eq!(results[1].outcome, MergeOutcome::Applied);
        assert_eq!(results[2].id, "c-room");
        assert_eq!(results[2].outcome, MergeOutcome::Applied);
    }

    #[tokio::test]
    async fn test_wrong_endpoint_is_rejected() {
        let merger = merger().await;
        let warehouse = change("c-wh", EntityType::Warehouse, "wh-1", ChangeAction::Create, "a", 1, 10);

        let (results, _) = merger
            .apply_raw_batch(vec![serde_json::to_value(&warehouse).unwrap()], Some(EntityType::Item))
            .await;

        assert_eq!(results[0].outcome, MergeOutcome::Rejected);
        assert!(InventoryRepository::new(merger.pool())
            .get_entity("wh-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_successor_of_unseen_change_converges_in_any_order() {
        let u1 = edit("u1", "a", 700, 100, "c-item", "u1");
        let u2 = edit("u2", "b", 1000, 101, "c-item", "u2");
        let mut u3 = edit("u3", "a", 700, 102, "u2", "u3");
        u3.local_seq = 11;

        // Delivered in causal order
        let in_order = merger().await;
        seed(&in_order).await;
        for record in [&u2, &u1, &u3] {
            in_order.apply(record).await.unwrap();
        }
        assert_eq!(description(&in_order).await, json!("u3"));

        // u3 overtakes the change it was built on
        let overtaken = merger().await;
        seed(&overtaken).await;
        overtaken.apply(&u1).await.unwrap();
        assert_eq!(overtaken.apply(&u3).await.unwrap().outcome, MergeOutcome::NotFound);
        overtaken.apply(&u2).await.unwrap();
        assert_eq!(description(&overtaken).await, json!("u2"));

        // The next delivery of u3 lands on top of u2
        assert_eq!(overtaken.apply(&u3).await.unwrap().outcome, MergeOutcome::Applied);
        assert_eq!(description(&overtaken).await, json!("u3"));
    }

    #[tokio::test]
    async fn test_batch_replays_unplaced_records_after_their_base() {
        let merger = merger().await;
        seed(&merger).await;

        // u3 sorts first but builds on u2
        let u2 = edit("u2", "b", 1000, 101, "c-item", "u2");
        let mut u3 = edit("u3", "a", 700, 50, "u2", "u3");
        u3.local_seq = 11;

        let (results, _) = merger.apply_batch(vec![u2, u3]).await;
        assert!(results.iter().all(|r| r.outcome == MergeOutcome::Applied));
        assert_eq!(description(&merger).await, json!("u3"));
    }

    #[tokio::test]
    async fn test_child_stamped_before_its_warehouse_still_applies() {
        let merger = merger().await;

        // Clock skew between devices: the item predates its warehouse
        let warehouse = change("c-wh", EntityType::Warehouse, "wh-1", ChangeAction::Create, "c", 1, 3600);
        let item = change("c-item", EntityType::Item, "item-1", ChangeAction::Create, "d", 1, 0);

        let (results, _) = merger.apply_batch(vec![warehouse, item]).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome.is_settled()));
        assert!(InventoryRepository::new(merger.pool())
            .get_entity("item-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_edit_inside_deleted_warehouse_is_settled_as_stale() {
        let merger = merger().await;
        seed(&merger).await;

        let mut delete = change("d-wh", EntityType::Warehouse, "wh-1", ChangeAction::Delete, "a", 3, 30);
        delete.base_change_id = Some("c-wh".to_string());
        merger.apply(&delete).await.unwrap();

        let late = edit("u-late", "b", 700, 40, "c-item", "late");
        let report = merger.apply(&late).await.unwrap();

        assert_eq!(report.outcome, MergeOutcome::IgnoredStale);
        assert_ne!(description(&merger).await, json!("late"));
    }
}
