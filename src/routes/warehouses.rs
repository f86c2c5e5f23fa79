//! Catalog endpoints
//!
//! `GET /warehouses` lists what this node shares; the `POST` collection
//! endpoints receive pushed change records one hierarchy level at a time.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::inventory::{EntityType, InventoryRepository, WarehouseSummary};
use crate::routes::ApiJson;
use crate::state::AppState;
use crate::sync::{PushRequest, PushResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct WarehouseList {
    pub warehouses: Vec<WarehouseSummary>,
    pub timestamp: DateTime<Utc>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/warehouses", get(list_warehouses).post(push_warehouses))
        .route("/rooms", post(push_rooms))
        .route("/containers", post(push_containers))
        .route("/items", post(push_items))
}

/// Network-visible warehouses only
async fn list_warehouses(State(state): State<AppState>) -> Result<Json<WarehouseList>> {
    let repo = InventoryRepository::new(state.db());
    let warehouses = repo
        .list_visible_warehouses()
        .await?
        .into_iter()
        .map(WarehouseSummary::from)
        .collect();

    Ok(Json(WarehouseList {
        warehouses,
        timestamp: Utc::now(),
    }))
}

async fn push_warehouses(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PushRequest>,
) -> Json<PushResponse> {
    push(&state, EntityType::Warehouse, req).await
}

async fn push_rooms(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PushRequest>,
) -> Json<PushResponse> {
    push(&state, EntityType::Room, req).await
}

async fn push_containers(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PushRequest>,
) -> Json<PushResponse> {
    push(&state, EntityType::Container, req).await
}

async fn push_items(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PushRequest>,
) -> Json<PushResponse> {
    push(&state, EntityType::Item, req).await
}

/// Merge a pushed batch. Failures are reported per record, so the batch
/// as a whole always succeeds.
async fn push(state: &AppState, entity_type: EntityType, req: PushRequest) -> Json<PushResponse> {
    let retry = req
        .batch_id
        .as_deref()
        .map(|id| state.note_batch(id))
        .unwrap_or(false);

    let received = req.records.len();
    let (results, conflicts) = state
        .merger()
        .apply_raw_batch(req.records, Some(entity_type))
        .await;

    tracing::debug!(
        collection = entity_type.collection(),
        device_id = req.device_id.as_deref().unwrap_or("unknown"),
        batch_id = req.batch_id.as_deref().unwrap_or("none"),
        received,
        conflicts = conflicts.len(),
        retry,
        "Merged pushed records"
    );

    Json(PushResponse {
        results,
        conflicts,
        retry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::build_router;
    use crate::routes::test_support::{create_warehouse, send, test_state};
    use crate::sync::{ChangeAction, ChangeRecord, MergeOutcome};
    use axum::http::StatusCode;
    use serde_json::json;

    fn remote_record(id: &str, entity_type: EntityType, entity_id: &str, warehouse_id: &str) -> ChangeRecord {
        ChangeRecord {
            id: id.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            action: ChangeAction::Create,
            payload: json!({"name": entity_id}),
            actor_id: "editor-2".to_string(),
            actor_role_weight: 700,
            origin_device_id: "node-b".to_string(),
            warehouse_id: warehouse_id.to_string(),
            timestamp: Utc::now(),
            local_seq: 1,
            base_change_id: None,
        }
    }

    #[tokio::test]
    async fn test_only_public_warehouses_are_listed() {
        let state = test_state().await;
        create_warehouse(&state, "wh-public", true).await;
        create_warehouse(&state, "wh-private", false).await;
        let app = build_router(state);

        let (status, body) = send(&app, "GET", "/warehouses", None).await;
        assert_eq!(status, StatusCode::OK);

        let list: WarehouseList = serde_json::from_value(body).unwrap();
        assert_eq!(list.warehouses.len(), 1);
        assert_eq!(list.warehouses[0].id, "wh-public");
        assert_eq!(list.warehouses[0].name.as_deref(), Some("Warehouse wh-public"));
    }

    #[tokio::test]
    async fn test_push_applies_and_recognises_retry() {
        let state = test_state().await;
        create_warehouse(&state, "wh-1", true).await;
        let app = build_router(state.clone());

        let room = remote_record("chg-room", EntityType::Room, "room-1", "wh-1");
        let body = json!({"batchId": "b-1:rooms", "deviceId": "node-b", "records": [room]});

        let (status, first) = send(&app, "POST", "/rooms", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let first: PushResponse = serde_json::from_value(first).unwrap();
        assert!(!first.retry);
        assert_eq!(first.results[0].outcome, MergeOutcome::Applied);

        let (_, second) = send(&app, "POST", "/rooms", Some(body)).await;
        let second: PushResponse = serde_json::from_value(second).unwrap();
        assert!(second.retry);
        assert_eq!(second.results[0].outcome, MergeOutcome::AlreadyApplied);

        let entity = InventoryRepository::new(state.db())
            .get_entity("room-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.warehouse_id, "wh-1");
    }

    #[tokio::test]
    async fn test_bad_records_do_not_abort_the_batch() {
        let state = test_state().await;
        create_warehouse(&state, "wh-1", true).await;
        let app = build_router(state);

        let item = remote_record("chg-item", EntityType::Item, "item-1", "wh-1");
        let good = remote_record("chg-container", EntityType::Container, "box-1", "wh-1");
        let orphan = remote_record("chg-orphan", EntityType::Container, "box-2", "wh-missing");
        let body = json!({
            "records": [{"id": "broken", "entityType": "container"}, item, good, orphan]
        });

        let (status, body) = send(&app, "POST", "/containers", Some(body)).await;
        assert_eq!(status, StatusCode::OK);

        let response: PushResponse = serde_json::from_value(body).unwrap();
        let outcome = |id: &str| {
            response
                .results
                .iter()
                .find(|r| r.id == id)
                .map(|r| r.outcome)
                .unwrap()
        };
        assert_eq!(outcome("broken"), MergeOutcome::Rejected);
        assert_eq!(outcome("chg-item"), MergeOutcome::Rejected);
        assert_eq!(outcome("chg-container"), MergeOutcome::Applied);
        assert_eq!(outcome("chg-orphan"), MergeOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_json_error() {
        let app = build_router(test_state().await);

        let (status, body) = send(&app, "POST", "/items", Some(json!({"records": "nope"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }
}
