//! Route modules for the StockMesh node

use axum::{extract::FromRequest, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::state::AppState;

pub mod access;
pub mod info;
pub mod sync;
pub mod warehouses;

/// JSON body extractor whose rejections render as `{error}` bodies
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Build the full HTTP surface of a node
pub fn build_router(state: AppState) -> Router {
    // Cross-origin LAN clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(info::router())
        .merge(warehouses::router())
        .merge(sync::router())
        .merge(access::router())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn not_found() -> AppError {
    AppError::NotFound("No such endpoint".to_string())
}
