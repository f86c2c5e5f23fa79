//! SQLite storage for catalog state and the change log
//!
//! Every merge decision is committed through [`InventoryRepository::commit`],
//! which writes the change log row, the entity row and any conflict entry in
//! one transaction.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::types::{payload_is_public, Entity, EntityType};
use crate::sync::{
    ChangeAction, ChangeRecord, ConflictEntry, ConflictOutcome, ResolutionStrategy,
    SyncCheckpoint,
};

/// Merge status stored next to each change log row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Applied,
    Stale,
    Conflict,
}

impl ChangeStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Applied => "applied",
            ChangeStatus::Stale => "stale",
            ChangeStatus::Conflict => "conflict",
        }
    }
}

/// What a commit does to the entity row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEffect {
    /// Write the record's payload as the entity's new state
    Write,
    /// Mark the entity deleted
    Tombstone,
    /// Leave the entity untouched
    None,
}

impl EntityEffect {
    pub fn for_action(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Create | ChangeAction::Update => EntityEffect::Write,
            ChangeAction::Delete => EntityEffect::Tombstone,
        }
    }
}

/// One atomic merge result
#[derive(Debug)]
pub struct MergeCommit<'r> {
    pub record: &'r ChangeRecord,
    pub status: ChangeStatus,
    pub effect: EntityEffect,
    pub conflict: Option<&'r ConflictEntry>,
}

/// Stored access request
#[derive(Debug, Clone)]
pub struct NewAccessRequest {
    pub warehouse_id: String,
    pub requester_id: String,
    pub requester_name: String,
    pub requester_ip: Option<String>,
    pub message: Option<String>,
}

/// Repository for catalog persistence
pub struct InventoryRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> InventoryRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Get an entity by ID, tombstones included
    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT id, entity_type, warehouse_id, data, deleted, network_visible,
                   last_change_id, last_origin_device_id, last_local_seq, updated_at
            FROM entities
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    /// Ids of warehouses whose changes replicate, tombstones included so
    /// that deletions reach peers
    pub async fn shared_warehouse_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM entities WHERE entity_type = 'warehouse' AND network_visible = 1 ORDER BY id ASC",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Network-visible, live warehouses
    pub async fn list_visible_warehouses(&self) -> Result<Vec<Entity>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT id, entity_type, warehouse_id, data, deleted, network_visible,
                   last_change_id, last_origin_device_id, last_local_seq, updated_at
            FROM entities
            WHERE entity_type = 'warehouse' AND network_visible = 1 AND deleted = 0
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    /// Live entities belonging to a warehouse
    pub async fn list_entities(&self, warehouse_id: &str) -> Result<Vec<Entity>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT id, entity_type, warehouse_id, data, deleted, network_visible,
                   last_change_id, last_origin_device_id, last_local_seq, updated_at
            FROM entities
            WHERE warehouse_id = ? AND deleted = 0
            ORDER BY entity_type, id
            "#,
        )
        .bind(warehouse_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    // ------------------------------------------------------------------
    // Change log
    // ------------------------------------------------------------------

    /// Whether a change id has been recorded before (in any status)
    pub async fn is_known_change(&self, change_id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM change_log WHERE id = ?")
            .bind(change_id)
            .fetch_optional(self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// Get a logged change by id
    pub async fn get_change(&self, change_id: &str) -> Result<Option<ChangeRecord>> {
        let row = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, entity_type, entity_id, action, payload, actor_id, actor_role_weight,
                   origin_device_id, warehouse_id, timestamp, local_seq, base_change_id
            FROM change_log
            WHERE id = ?
            "#,
        )
        .bind(change_id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_record()).transpose()
    }

    /// Commit a merge decision atomically.
    ///
    /// Returns `false` when the change id was already logged; in that case
    /// nothing is written.
    pub async fn commit(&self, commit: MergeCommit<'_>) -> Result<bool> {
        let record = commit.record;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO change_log (
                id, entity_type, entity_id, action, payload, actor_id, actor_role_weight,
                origin_device_id, warehouse_id, timestamp, timestamp_us, local_seq,
                base_change_id, status, logged_us
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(record.action.as_str())
        .bind(serde_json::to_string(&record.payload)?)
        .bind(&record.actor_id)
        .bind(record.actor_role_weight)
        .bind(&record.origin_device_id)
        .bind(&record.warehouse_id)
        .bind(record.timestamp.to_rfc3339())
        .bind(record.timestamp.timestamp_micros())
        .bind(record.local_seq as i64)
        .bind(&record.base_change_id)
        .bind(commit.status.as_str())
        .bind(Utc::now().timestamp_micros())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        match commit.effect {
            EntityEffect::Write => {
                let visible = record.entity_type == EntityType::Warehouse
                    && payload_is_public(&record.payload);
                sqlx::query(
                    r#"
                    INSERT INTO entities (
                        id, entity_type, warehouse_id, data, deleted, network_visible,
                        last_change_id, last_origin_device_id, last_local_seq,
                        last_timestamp_us, updated_at
                    ) VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        data = excluded.data,
                        deleted = 0,
                        network_visible = excluded.network_visible,
                        last_change_id = excluded.last_change_id,
                        last_origin_device_id = excluded.last_origin_device_id,
                        last_local_seq = excluded.last_local_seq,
                        last_timestamp_us = excluded.last_timestamp_us,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&record.entity_id)
                .bind(record.entity_type.as_str())
                .bind(&record.warehouse_id)
                .bind(serde_json::to_string(&record.payload)?)
                .bind(visible)
                .bind(&record.id)
                .bind(&record.origin_device_id)
                .bind(record.local_seq as i64)
                .bind(record.timestamp.timestamp_micros())
                .bind(record.timestamp.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
            EntityEffect::Tombstone => {
                sqlx::query(
                    r#"
                    UPDATE entities SET
                        deleted = 1,
                        last_change_id = ?,
                        last_origin_device_id = ?,
                        last_local_seq = ?,
                        last_timestamp_us = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&record.id)
                .bind(&record.origin_device_id)
                .bind(record.local_seq as i64)
                .bind(record.timestamp.timestamp_micros())
                .bind(record.timestamp.to_rfc3339())
                .bind(&record.entity_id)
                .execute(&mut *tx)
                .await?;
            }
            EntityEffect::None => {}
        }

        if let Some(conflict) = commit.conflict {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO conflicts (
                    id, entity_type, entity_id, local_json, remote_json, strategy,
                    outcome, requires_manual_review, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&conflict.id)
            .bind(conflict.entity_type.as_str())
            .bind(&conflict.entity_id)
            .bind(serde_json::to_string(&conflict.local)?)
            .bind(serde_json::to_string(&conflict.remote)?)
            .bind(conflict.resolution_strategy.as_str())
            .bind(conflict.outcome.as_str())
            .bind(conflict.requires_manual_review)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Applied changes logged on this device after `since`, in replay
    /// order.
    ///
    /// The boundary is the local log time rather than the record's own
    /// timestamp, so records relayed from a third device are not skipped.
    /// `warehouses` restricts the result to those warehouse scopes;
    /// `exclude_origin` drops records that originated on that device.
    pub async fn changes_since(
        &self,
        since: Option<DateTime<Utc>>,
        warehouses: Option<&[String]>,
        exclude_origin: Option<&str>,
    ) -> Result<Vec<ChangeRecord>> {
        if let Some(ids) = warehouses {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut sql = String::from(
            r#"
            SELECT id, entity_type, entity_id, action, payload, actor_id, actor_role_weight,
                   origin_device_id, warehouse_id, timestamp, local_seq, base_change_id
            FROM change_log
            WHERE logged_us > ?
            "#,
        );

        if let Some(ids) = warehouses {
            let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND warehouse_id IN ({})", placeholders.join(", ")));
        }
        if exclude_origin.is_some() {
            sql.push_str(" AND origin_device_id != ?");
        }
        sql.push_str(" ORDER BY timestamp_us ASC, local_seq ASC, id ASC");

        let since_us = since.map(|s| s.timestamp_micros()).unwrap_or(i64::MIN);
        let mut q = sqlx::query_as::<_, ChangeRow>(&sql).bind(since_us);
        if let Some(ids) = warehouses {
            for id in ids {
                q = q.bind(id);
            }
        }
        if let Some(origin) = exclude_origin {
            q = q.bind(origin);
        }

        let rows = q.fetch_all(self.pool).await?;
        rows.into_iter().map(|r| r.into_record()).collect()
    }

    /// Number of logged changes
    pub async fn change_count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_log")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0 as u64)
    }

    /// Allocate the next per-device sequence number
    pub async fn next_local_seq(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO device_state (key, value) VALUES ('local_seq', 1)
            ON CONFLICT(key) DO UPDATE SET value = value + 1
            RETURNING value
            "#,
        )
        .fetch_one(self.pool)
        .await?;

        Ok(row.0 as u64)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    pub async fn list_conflicts(&self, pending_only: bool) -> Result<Vec<ConflictEntry>> {
        let sql = if pending_only {
            r#"
            SELECT id, entity_type, entity_id, local_json, remote_json, strategy,
                   outcome, requires_manual_review
            FROM conflicts WHERE outcome = 'pending' ORDER BY created_at ASC
            "#
        } else {
            r#"
            SELECT id, entity_type, entity_id, local_json, remote_json, strategy,
                   outcome, requires_manual_review
            FROM conflicts ORDER BY created_at ASC
            "#
        };

        let rows = sqlx::query_as::<_, ConflictRow>(sql)
            .fetch_all(self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }

    pub async fn get_conflict(&self, id: &str) -> Result<Option<ConflictEntry>> {
        let row = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT id, entity_type, entity_id, local_json, remote_json, strategy,
                   outcome, requires_manual_review
            FROM conflicts WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_entry()).transpose()
    }

    pub async fn count_pending_conflicts(&self) -> Result<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts WHERE outcome = 'pending'")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0 as usize)
    }

    /// Settle a pending conflict; returns false if it was not pending
    pub async fn settle_conflict(&self, id: &str, outcome: ConflictOutcome) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conflicts SET outcome = ?, resolved_at = ? WHERE id = ? AND outcome = 'pending'",
        )
        .bind(outcome.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub async fn load_checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT peer_id, last_exchanged_us, last_pushed_us FROM sync_checkpoints",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(peer_id, pulled, pushed)| {
                Some(SyncCheckpoint {
                    peer_id,
                    last_exchanged: from_micros(pulled)?,
                    last_pushed: from_micros(pushed)?,
                })
            })
            .collect())
    }

    /// Persist a checkpoint; an older boundary never overwrites a newer one
    pub async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (peer_id, last_exchanged_us, last_pushed_us, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(peer_id) DO UPDATE SET
                last_exchanged_us = MAX(last_exchanged_us, excluded.last_exchanged_us),
                last_pushed_us = MAX(last_pushed_us, excluded.last_pushed_us),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.peer_id)
        .bind(checkpoint.last_exchanged.timestamp_micros())
        .bind(checkpoint.last_pushed.timestamp_micros())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Access requests
    // ------------------------------------------------------------------

    /// Store a pending access request; returns `None` if the requester
    /// already has one pending for this warehouse
    pub async fn create_access_request(&self, request: &NewAccessRequest) -> Result<Option<String>> {
        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM access_requests
            WHERE warehouse_id = ? AND requester_id = ? AND status = 'pending'
            "#,
        )
        .bind(&request.warehouse_id)
        .bind(&request.requester_id)
        .fetch_optional(self.pool)
        .await?;

        if existing.is_some() {
            return Ok(None);
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO access_requests (
                id, warehouse_id, requester_id, requester_name, requester_ip,
                message, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(&request.warehouse_id)
        .bind(&request.requester_id)
        .bind(&request.requester_name)
        .bind(&request.requester_ip)
        .bind(&request.message)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(Some(id))
    }
}

fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(us.div_euclid(1_000_000), (us.rem_euclid(1_000_000) * 1_000) as u32)
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    entity_type: String,
    warehouse_id: String,
    data: String,
    deleted: bool,
    network_visible: bool,
    last_change_id: String,
    last_origin_device_id: String,
    last_local_seq: i64,
    updated_at: String,
}

impl EntityRow {
    fn into_entity(self) -> Result<Entity> {
        let entity_type = EntityType::parse(&self.entity_type)
            .ok_or_else(|| anyhow::anyhow!("unknown entity type {}", self.entity_type))?;
        let data: Value = serde_json::from_str(&self.data)?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)?.with_timezone(&Utc);

        Ok(Entity {
            id: self.id,
            entity_type,
            warehouse_id: self.warehouse_id,
            data,
            deleted: self.deleted,
            network_visible: self.network_visible,
            last_change_id: self.last_change_id,
            last_origin_device_id: self.last_origin_device_id,
            last_local_seq: self.last_local_seq as u64,
            updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    id: String,
    entity_type: String,
    entity_id: String,
    action: String,
    payload: String,
    actor_id: String,
    actor_role_weight: i64,
    origin_device_id: String,
    warehouse_id: String,
    timestamp: String,
    local_seq: i64,
    base_change_id: Option<String>,
}

impl ChangeRow {
    fn into_record(self) -> Result<ChangeRecord> {
        let entity_type = EntityType::parse(&self.entity_type)
            .ok_or_else(|| anyhow::anyhow!("unknown entity type {}", self.entity_type))?;
        let action = ChangeAction::parse(&self.action)
            .ok_or_else(|| anyhow::anyhow!("unknown action {}", self.action))?;
        let payload: Value = serde_json::from_str(&self.payload)?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)?.with_timezone(&Utc);

        Ok(ChangeRecord {
            id: self.id,
            entity_type,
            entity_id: self.entity_id,
            action,
            payload,
            actor_id: self.actor_id,
            actor_role_weight: self.actor_role_weight,
            origin_device_id: self.origin_device_id,
            warehouse_id: self.warehouse_id,
            timestamp,
            local_seq: self.local_seq as u64,
            base_change_id: self.base_change_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_type: String,
    entity_id: String,
    local_json: String,
    remote_json: String,
    strategy: String,
    outcome: String,
    requires_manual_review: bool,
}

impl ConflictRow {
    fn into_entry(self) -> Result<ConflictEntry> {
        let entity_type = EntityType::parse(&self.entity_type)
            .ok_or_else(|| anyhow::anyhow!("unknown entity type {}", self.entity_type))?;

        Ok(ConflictEntry {
            id: self.id,
            entity_type,
            entity_id: self.entity_id,
            local: serde_json::from_str(&self.local_json)?,
            remote: serde_json::from_str(&self.remote_json)?,
            resolution_strategy: ResolutionStrategy::parse(&self.strategy),
            outcome: ConflictOutcome::parse(&self.outcome),
            requires_manual_review: self.requires_manual_review,
        })
    }
}
