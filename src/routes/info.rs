//! Device identity endpoints

use std::net::{IpAddr, Ipv4Addr};

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::DeviceInfo;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/info", get(device_info))
        .route("/ping", get(ping))
}

/// Who this node is; also the probe target for subnet discovery
async fn device_info(State(state): State<AppState>) -> Json<DeviceInfo> {
    let config = state.config();
    let ip = local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    Json(DeviceInfo {
        id: config.device.id.clone(),
        name: config.device.name.clone(),
        ip,
        port: state.port(),
        capabilities: config.device.capabilities.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        kind: "pong".to_string(),
        timestamp: Utc::now(),
    })
}
