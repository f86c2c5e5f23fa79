//! Access request endpoint

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::inventory::{EntityType, InventoryRepository, NewAccessRequest};
use crate::routes::ApiJson;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestBody {
    pub warehouse_id: String,
    pub requester_id: String,
    pub requester_name: String,
    #[serde(default)]
    pub requester_ip: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessRequestCreated {
    pub status: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/access-request", post(create_access_request))
}

/// Ask the owner of a shared warehouse for access
async fn create_access_request(
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    ApiJson(body): ApiJson<AccessRequestBody>,
) -> Result<(StatusCode, Json<AccessRequestCreated>)> {
    for (field, value) in [
        ("warehouseId", &body.warehouse_id),
        ("requesterId", &body.requester_id),
        ("requesterName", &body.requester_name),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::BadRequest(format!("{} is required", field)));
        }
    }

    let repo = InventoryRepository::new(state.db());

    // Private warehouses do not exist as far as the network is concerned
    let shared = repo
        .get_entity(&body.warehouse_id)
        .await?
        .filter(|e| e.entity_type == EntityType::Warehouse && !e.deleted && e.network_visible);
    if shared.is_none() {
        return Err(AppError::NotFound(format!(
            "Warehouse not found: {}",
            body.warehouse_id
        )));
    }

    let requester_ip = body
        .requester_ip
        .or_else(|| remote.map(|ConnectInfo(addr)| addr.ip().to_string()));

    let request = NewAccessRequest {
        warehouse_id: body.warehouse_id,
        requester_id: body.requester_id,
        requester_name: body.requester_name,
        requester_ip,
        message: body.message,
    };

    let request_id = repo.create_access_request(&request).await?.ok_or_else(|| {
        AppError::Conflict(format!(
            "Access request already pending for {} on {}",
            request.requester_id, request.warehouse_id
        ))
    })?;

    tracing::info!(
        request_id = %request_id,
        warehouse_id = %request.warehouse_id,
        requester_id = %request.requester_id,
        "Access request created"
    );

    Ok((
        StatusCode::CREATED,
        Json(AccessRequestCreated {
            status: "request_created".to_string(),
            request_id,
        }),
    ))
}
