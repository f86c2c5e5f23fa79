//! Sync data types
//!
//! Defines the wire and domain types for peer synchronization:
//! - Change records, the immutable unit of replication
//! - Per-record merge outcomes
//! - Conflict entries awaiting review
//! - Push / sync request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inventory::EntityType;
use crate::stats::StatsSnapshot;

/// Types of catalog mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ChangeAction::Create),
            "update" => Some(ChangeAction::Update),
            "delete" => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

/// One local mutation, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique change ID
    pub id: String,
    /// Level of the entity in the hierarchy
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    /// Entity ID
    #[serde(rename = "entityId")]
    pub entity_id: String,
    /// Type of mutation
    pub action: ChangeAction,
    /// The data payload (JSON)
    #[serde(default)]
    pub payload: Value,
    /// Actor who made the change
    #[serde(rename = "actorId")]
    pub actor_id: String,
    /// Role weight of the actor at creation time
    #[serde(rename = "actorRoleWeight", default)]
    pub actor_role_weight: i64,
    /// Device that created this change
    #[serde(rename = "originDeviceId")]
    pub origin_device_id: String,
    /// Warehouse scope of the entity
    #[serde(rename = "warehouseId")]
    pub warehouse_id: String,
    /// Wall clock time of the mutation
    pub timestamp: DateTime<Utc>,
    /// Per-device sequence number
    #[serde(rename = "localSeq")]
    pub local_seq: u64,
    /// Last change of this entity the author had observed
    #[serde(rename = "baseChangeId", default, skip_serializing_if = "Option::is_none")]
    pub base_change_id: Option<String>,
}

impl ChangeRecord {
    /// Replay order: timestamp, then per-device sequence, then id so that
    /// equal keys from different devices still sort identically everywhere.
    pub fn replay_key(&self) -> (DateTime<Utc>, u64, &str) {
        (self.timestamp, self.local_seq, self.id.as_str())
    }

    pub fn sort_for_replay(records: &mut [ChangeRecord]) {
        records.sort_by(|a, b| a.replay_key().cmp(&b.replay_key()));
    }

    /// Basic shape checks that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("record id is empty".to_string());
        }
        if self.entity_id.trim().is_empty() {
            return Err(format!("record {} has an empty entityId", self.id));
        }
        if self.warehouse_id.trim().is_empty() {
            return Err(format!("record {} has an empty warehouseId", self.id));
        }
        if self.entity_type == EntityType::Warehouse && self.entity_id != self.warehouse_id {
            return Err(format!(
                "warehouse record {} must use its own id as warehouseId",
                self.id
            ));
        }
        if self.origin_device_id.trim().is_empty() {
            return Err(format!("record {} has no originDeviceId", self.id));
        }
        Ok(())
    }
}

/// Result of merging one incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeOutcome {
    /// Local state now reflects the record
    Applied,
    /// The record id was seen before; nothing changed
    AlreadyApplied,
    /// Local state already holds a winning change
    IgnoredStale,
    /// Parked as a conflict for manual review
    ConflictRecorded,
    /// Targets an unknown warehouse or entity
    NotFound,
    /// Malformed or sent to the wrong endpoint
    Rejected,
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Applied => "applied",
            MergeOutcome::AlreadyApplied => "already-applied",
            MergeOutcome::IgnoredStale => "ignored-stale",
            MergeOutcome::ConflictRecorded => "conflict-recorded",
            MergeOutcome::NotFound => "not-found",
            MergeOutcome::Rejected => "rejected",
        }
    }

    /// Whether the record has reached a final state on the receiver.
    ///
    /// Not-found records may succeed later once their parent or base change
    /// arrives; rejected ones are resent after the sender's fix or the
    /// receiver's storage recovers. Neither may move a checkpoint past them.
    pub fn is_settled(&self) -> bool {
        !matches!(self, MergeOutcome::NotFound | MergeOutcome::Rejected)
    }
}

/// Per-record outcome reported to the sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub id: String,
    pub outcome: MergeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordResult {
    pub fn new(id: impl Into<String>, outcome: MergeOutcome) -> Self {
        Self {
            id: id.into(),
            outcome,
            error: None,
        }
    }

    pub fn rejected(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: MergeOutcome::Rejected,
            error: Some(error.into()),
        }
    }
}

/// Strategy that decided (or failed to decide) a pair of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Higher role weight wins
    RoleWeight,
    /// Equal weight, later timestamp wins
    LatestTimestamp,
    /// Cannot be decided automatically
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::RoleWeight => "role_weight",
            ResolutionStrategy::LatestTimestamp => "latest_timestamp",
            ResolutionStrategy::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "role_weight" => ResolutionStrategy::RoleWeight,
            "latest_timestamp" => ResolutionStrategy::LatestTimestamp,
            _ => ResolutionStrategy::Manual,
        }
    }
}

/// Lifecycle state of a conflict entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    Pending,
    KeptLocal,
    AcceptedRemote,
}

impl ConflictOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictOutcome::Pending => "pending",
            ConflictOutcome::KeptLocal => "kept_local",
            ConflictOutcome::AcceptedRemote => "accepted_remote",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "kept_local" => ConflictOutcome::KeptLocal,
            "accepted_remote" => ConflictOutcome::AcceptedRemote,
            _ => ConflictOutcome::Pending,
        }
    }
}

/// How a user settles a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepLocal,
    AcceptRemote,
}

/// A pair of records the resolver would not decide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub id: String,
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub local: ChangeRecord,
    pub remote: ChangeRecord,
    #[serde(rename = "resolutionStrategy")]
    pub resolution_strategy: ResolutionStrategy,
    pub outcome: ConflictOutcome,
    #[serde(rename = "requiresManualReview")]
    pub requires_manual_review: bool,
}

/// Push body for `POST /warehouses|/rooms|/containers|/items`.
///
/// Records stay raw JSON so a single malformed record is rejected on its
/// own instead of failing the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    /// Stable id of the outbound batch; repeated on retries
    #[serde(rename = "batchId", default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Device making the push
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub records: Vec<Value>,
}

/// Response from a push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<RecordResult>,
    pub conflicts: Vec<ConflictEntry>,
    /// The batch id was seen before
    #[serde(default)]
    pub retry: bool,
}

/// Body of `POST /sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "lastSync")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Restrict the pull to these warehouses (still limited to visible ones)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouses: Option<Vec<String>>,
    /// Optional records pushed in the same round trip
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Value>,
}

/// Records grouped by collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    #[serde(default)]
    pub warehouses: Vec<ChangeRecord>,
    #[serde(default)]
    pub rooms: Vec<ChangeRecord>,
    #[serde(default)]
    pub containers: Vec<ChangeRecord>,
    #[serde(default)]
    pub items: Vec<ChangeRecord>,
}

impl SyncData {
    pub fn from_records(records: Vec<ChangeRecord>) -> Self {
        let mut data = SyncData::default();
        for record in records {
            match record.entity_type {
                EntityType::Warehouse => data.warehouses.push(record),
                EntityType::Room => data.rooms.push(record),
                EntityType::Container => data.containers.push(record),
                EntityType::Item => data.items.push(record),
            }
        }
        data
    }

    /// Flatten back into replay order
    pub fn into_records(self) -> Vec<ChangeRecord> {
        let mut records: Vec<ChangeRecord> = self
            .warehouses
            .into_iter()
            .chain(self.rooms)
            .chain(self.containers)
            .chain(self.items)
            .collect();
        ChangeRecord::sort_for_replay(&mut records);
        records
    }

    pub fn len(&self) -> usize {
        self.warehouses.len() + self.rooms.len() + self.containers.len() + self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response from `POST /sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "syncTimestamp")]
    pub sync_timestamp: DateTime<Utc>,
    pub data: SyncData,
    pub conflicts: Vec<ConflictEntry>,
    /// Outcomes for records pushed inline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<RecordResult>,
}

/// Response from `GET /sync/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub statistics: SyncStatistics,
    pub capabilities: Vec<String>,
}

/// Counters and gauges reported by `GET /sync/status`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatistics {
    #[serde(rename = "knownPeers")]
    pub known_peers: usize,
    #[serde(rename = "pendingConflicts")]
    pub pending_conflicts: usize,
    #[serde(rename = "offlineBatches")]
    pub offline_batches: usize,
    #[serde(rename = "changeCount")]
    pub change_count: u64,
    #[serde(flatten)]
    pub counters: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, seq: u64, ts_secs: i64) -> ChangeRecord {
        ChangeRecord {
            id: id.to_string(),
            entity_type: EntityType::Item,
            entity_id: "item-1".to_string(),
            action: ChangeAction::Update,
            payload: serde_json::json!({"description": id}),
            actor_id: "actor-1".to_string(),
            actor_role_weight: 700,
            origin_device_id: "device-1".to_string(),
            warehouse_id: "wh-1".to_string(),
            timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
            local_seq: seq,
            base_change_id: None,
        }
    }

    #[test]
    fn test_replay_order_uses_seq_on_equal_timestamps() {
        let mut records = vec![record("c", 3, 100), record("a", 1, 100), record("b", 2, 99)];
        ChangeRecord::sort_for_replay(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_change_record_wire_names() {
        let json = serde_json::to_value(record("r1", 1, 100)).unwrap();
        assert_eq!(json["entityType"], "item");
        assert_eq!(json["localSeq"], 1);
        assert_eq!(json["actorRoleWeight"], 700);
        assert!(json.get("baseChangeId").is_none());
    }

    #[test]
    fn test_outcome_wire_names() {
        let json = serde_json::to_string(&MergeOutcome::IgnoredStale).unwrap();
        assert_eq!(json, "\"ignored-stale\"");
        assert_eq!(MergeOutcome::AlreadyApplied.as_str(), "already-applied");
    }

    #[test]
    fn test_only_final_outcomes_are_settled() {
        assert!(MergeOutcome::Applied.is_settled());
        assert!(MergeOutcome::IgnoredStale.is_settled());
        assert!(MergeOutcome::ConflictRecorded.is_settled());
        assert!(!MergeOutcome::NotFound.is_settled());
        assert!(!MergeOutcome::Rejected.is_settled());
    }

    #[test]
    fn test_validate_rejects_warehouse_scope_mismatch() {
        let mut r = record("r1", 1, 100);
        r.entity_type = EntityType::Warehouse;
        r.entity_id = "wh-2".to_string();
        assert!(r.validate().is_err());

        r.entity_id = "wh-1".to_string();
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_sync_data_grouping() {
        let mut warehouse = record("w", 1, 100);
        warehouse.entity_type = EntityType::Warehouse;
        let item = record("i", 2, 101);

        let data = SyncData::from_records(vec![item.clone(), warehouse.clone()]);
        assert_eq!(data.warehouses.len(), 1);
        assert_eq!(data.items.len(), 1);
        assert_eq!(data.into_records(), vec![warehouse, item]);
    }
}
