//! Sync API endpoints
//!
//! Provides endpoints for peer synchronization and conflict review.

use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::inventory::InventoryRepository;
use crate::routes::ApiJson;
use crate::state::AppState;
use crate::sync::{
    ChangeRecord, ConflictChoice, ConflictEntry, SyncData, SyncRequest, SyncResponse,
    SyncStatistics, SyncStatusResponse,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync))
        .route("/sync/status", get(status))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/:id", post(resolve_conflict))
}

/// Body of `POST /sync/conflicts/:id`
#[derive(Debug, Deserialize)]
pub struct ResolveConflictRequest {
    pub choice: ConflictChoice,
    #[serde(rename = "actorId")]
    pub actor_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictList {
    pub conflicts: Vec<ConflictEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveConflictResponse {
    pub resolved: String,
    pub change: ChangeRecord,
}

/// Full pull, with optional inline push.
///
/// Returns every change this node logged after `lastSync` for its shared
/// warehouses, whatever its local merge status, minus what the requester
/// authored itself.
async fn sync(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SyncRequest>,
) -> Result<Json<SyncResponse>> {
    if req.device_id.trim().is_empty() {
        return Err(AppError::BadRequest("deviceId is required".to_string()));
    }

    // Taken before the query so nothing logged meanwhile is skipped next time
    let sync_timestamp = Utc::now();

    let (results, conflicts) = if req.records.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        state.merger().apply_raw_batch(req.records, None).await
    };

    let repo = InventoryRepository::new(state.db());
    let mut visible = repo.shared_warehouse_ids().await?;
    if let Some(requested) = &req.warehouses {
        let requested: HashSet<&String> = requested.iter().collect();
        visible.retain(|id| requested.contains(id));
    }

    let records = repo
        .changes_since(req.last_sync, Some(&visible), Some(&req.device_id))
        .await?;

    tracing::debug!(
        device_id = %req.device_id,
        last_sync = ?req.last_sync,
        records = records.len(),
        inline = results.len(),
        "Serving sync pull"
    );

    Ok(Json(SyncResponse {
        sync_timestamp,
        data: SyncData::from_records(records),
        conflicts,
        results,
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<SyncStatusResponse>> {
    let repo = InventoryRepository::new(state.db());

    let statistics = SyncStatistics {
        known_peers: state.registry().len().await,
        pending_conflicts: repo.count_pending_conflicts().await?,
        offline_batches: state.batcher().offline_len(),
        change_count: repo.change_count().await?,
        counters: state.stats().snapshot(),
    };

    Ok(Json(SyncStatusResponse {
        device_id: state.device_id().to_string(),
        statistics,
        capabilities: state.config().device.capabilities.clone(),
    }))
}

async fn list_conflicts(State(state): State<AppState>) -> Result<Json<ConflictList>> {
    let conflicts = state.merger().pending_conflicts().await?;
    Ok(Json(ConflictList { conflicts }))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ResolveConflictRequest>,
) -> Result<Json<ResolveConflictResponse>> {
    if req.actor_id.trim().is_empty() {
        return Err(AppError::BadRequest("actorId is required".to_string()));
    }

    let change = state
        .local()
        .resolve_conflict(&id, req.choice, &req.actor_id)
        .await?;

    Ok(Json(ResolveConflictResponse {
        resolved: id,
        change,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::EntityType;
    use crate::routes::build_router;
    use crate::routes::test_support::{create_warehouse, send, test_state};
    use crate::sync::{ChangeAction, LocalMutation, MergeOutcome, Role};
    use axum::http::StatusCode;
    use serde_json::json;

    async fn add_item(state: &AppState, warehouse_id: &str, item_id: &str) -> ChangeRecord {
        state
            .local()
            .commit(LocalMutation {
                entity_type: EntityType::Item,
                entity_id: item_id.to_string(),
                warehouse_id: warehouse_id.to_string(),
                action: ChangeAction::Create,
                payload: json!({"name": item_id, "quantity": 3}),
                actor_id: "owner-1".to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pull_returns_only_visible_warehouses() {
        let state = test_state().await;
        create_warehouse(&state, "wh-public", true).await;
        create_warehouse(&state, "wh-private", false).await;
        add_item(&state, "wh-public", "item-1").await;
        add_item(&state, "wh-private", "item-2").await;
        let app = build_router(state);

        let (status, body) = send(
            &app,
            "POST",
            "/sync",
            Some(json!({"deviceId": "node-b", "lastSync": null})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response: SyncResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.data.warehouses.len(), 1);
        assert_eq!(response.data.items.len(), 1);
        assert_eq!(response.data.items[0].entity_id, "item-1");
    }

    #[tokio::test]
    async fn test_pull_after_timestamp_is_incremental() {
        let state = test_state().await;
        create_warehouse(&state, "wh-1", true).await;
        let app = build_router(state.clone());

        let (_, first) = send(&app, "POST", "/sync", Some(json!({"deviceId": "node-b", "lastSync": null}))).await;
        let first: SyncResponse = serde_json::from_value(first).unwrap();
        assert_eq!(first.data.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        add_item(&state, "wh-1", "item-1").await;

        let (_, second) = send(
            &app,
            "POST",
            "/sync",
            Some(json!({"deviceId": "node-b", "lastSync": first.sync_timestamp})),
        )
        .await;
        let second: SyncResponse = serde_json::from_value(second).unwrap();
        assert_eq!(second.data.len(), 1);
        assert_eq!(second.data.items.len(), 1);
    }

    #[tokio::test]
    async fn test_pull_excludes_requesters_own_records() {
        let state = test_state().await;
        let app = build_router(state.clone());
        create_warehouse(&state, "wh-1", true).await;

        add_item(&state, "wh-1", "item-1").await;

        // Everything here was authored by node-a itself
        let (_, body) = send(&app, "POST", "/sync", Some(json!({"deviceId": "node-a", "lastSync": null}))).await;
        let response: SyncResponse = serde_json::from_value(body).unwrap();
        assert!(response.data.is_empty());

        let (_, body) = send(&app, "POST", "/sync", Some(json!({"deviceId": "node-c", "lastSync": null}))).await;
        let response: SyncResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.data.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_requires_device_id() {
        let app = build_router(test_state().await);

        let (status, body) = send(&app, "POST", "/sync", Some(json!({"deviceId": " ", "lastSync": null}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "deviceId is required");

        let (status, _) = send(&app, "POST", "/sync", Some(json!({"lastSync": null}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let state = test_state().await;
        create_warehouse(&state, "wh-1", true).await;
        let app = build_router(state);

        let (status, body) = send(&app, "GET", "/sync/status", None).await;
        assert_eq!(status, StatusCode::OK);

        let response: SyncStatusResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.device_id, "node-a");
        assert_eq!(response.statistics.change_count, 1);
        assert_eq!(response.statistics.pending_conflicts, 0);
        assert!(response.capabilities.iter().any(|c| c == "warehouses"));
    }

    #[tokio::test]
    async fn test_conflict_review_round_trip() {
        let state = test_state().await;
        let created = create_warehouse(&state, "wh-1", true).await;
        state.roles().assign("wh-1", "editor-a", Role::Editor);
        state.roles().assign("wh-1", "editor-b", Role::Editor);

        // Local delete by an editor
        state
            .local()
            .commit(LocalMutation {
                entity_type: EntityType::Warehouse,
                entity_id: "wh-1".to_string(),
                warehouse_id: "wh-1".to_string(),
                action: ChangeAction::Delete,
                payload: json!(null),
                actor_id: "editor-a".to_string(),
            })
            .await
            .unwrap();

        // Concurrent remote update based on the original creation
        let remote = ChangeRecord {
            id: "chg-remote".to_string(),
            entity_type: EntityType::Warehouse,
            entity_id: "wh-1".to_string(),
            action: ChangeAction::Update,
            payload: json!({"name": "Renamed", "isPublic": true}),
            actor_id: "editor-b".to_string(),
            actor_role_weight: 700,
            origin_device_id: "node-b".to_string(),
            warehouse_id: "wh-1".to_string(),
            timestamp: Utc::now(),
            local_seq: 4,
            base_change_id: Some(created.id.clone()),
        };
        let report = state.merger().apply(&remote).await.unwrap();
        assert_eq!(report.outcome, MergeOutcome::ConflictRecorded);

        let app = build_router(state.clone());
        let (status, body) = send(&app, "GET", "/sync/conflicts", None).await;
        assert_eq!(status, StatusCode::OK);
        let list: ConflictList = serde_json::from_value(body).unwrap();
        assert_eq!(list.conflicts.len(), 1);
        let conflict_id = list.conflicts[0].id.clone();

        let uri = format!("/sync/conflicts/{}", conflict_id);
        let (status, body) = send(
            &app,
            "POST",
            &uri,
            Some(json!({"choice": "accept_remote", "actorId": "owner-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resolved: ResolveConflictResponse = serde_json::from_value(body).unwrap();
        assert_eq!(resolved.change.action, ChangeAction::Update);

        let entity = InventoryRepository::new(state.db())
            .get_entity("wh-1")
            .await
            .unwrap()
            .unwrap();
        assert!(!entity.deleted);
        assert_eq!(entity.data["name"], "Renamed");

        let (status, _) = send(
            &app,
            "POST",
            &uri,
            Some(json!({"choice": "keep_local", "actorId": "owner-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            "POST",
            "/sync/conflicts/missing",
            Some(json!({"choice": "keep_local", "actorId": "owner-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
