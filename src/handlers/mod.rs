//! HTTP endpoint handlers.

pub mod admin;
pub mod webhooks;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses((status = 200, description = "Service is up"))
)]
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness and build info, including a database round-trip.
#[utoipa::path(
    get,
    path = "/api/v1/status",
    tag = "system",
    responses((status = 200, description = "Service status"))
)]
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.db.ping().await.is_ok();
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "database": if db_ok { "ok" } else { "unreachable" },
        "receipts_enabled": state.config.nalogo_enabled,
    }))
}
