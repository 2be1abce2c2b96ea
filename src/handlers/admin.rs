//! Operator endpoints, guarded by a shared admin token.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{errors::ServiceError, services::ReceiptOutcome, AppState};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Deserialize)]
pub struct RetryReceiptQuery {
    /// Bypass a scheduled retry wait. A live lease and the applied marker
    /// still hold.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RetryReceiptResponse {
    pub payment_id: Uuid,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Retry the tax receipt for one payment on operator demand.
#[utoipa::path(
    post,
    path = "/api/v1/admin/receipts/{payment_id}/retry",
    tag = "admin",
    params(
        ("payment_id" = Uuid, Path, description = "Ledger payment id"),
        ("force" = Option<bool>, Query, description = "Bypass a scheduled retry wait")
    ),
    responses(
        (status = 200, description = "Retry attempted", body = RetryReceiptResponse),
        (status = 401, description = "Missing or wrong admin token", body = crate::errors::ErrorResponse),
        (status = 404, description = "No such payment", body = crate::errors::ErrorResponse)
    )
)]
pub async fn retry_receipt(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Query(query): Query<RetryReceiptQuery>,
    headers: HeaderMap,
) -> Result<Json<RetryReceiptResponse>, ServiceError> {
    require_admin(&state, &headers)?;

    info!(%payment_id, force = query.force, "operator receipt retry");
    let outcome = state.receipts.process_one(payment_id, query.force).await?;

    if matches!(outcome, ReceiptOutcome::NotFound) {
        return Err(ServiceError::NotFound(format!(
            "payment {} not found",
            payment_id
        )));
    }

    let mut response = RetryReceiptResponse {
        payment_id,
        outcome: outcome.as_str().to_string(),
        receipt_uuid: None,
        next_retry_at: None,
        error: None,
    };
    match outcome {
        ReceiptOutcome::Created { uuid } => response.receipt_uuid = Some(uuid),
        ReceiptOutcome::RetryWait { until } => response.next_retry_at = Some(until),
        ReceiptOutcome::Failed {
            error,
            next_retry_at,
        } => {
            response.error = Some(error);
            response.next_retry_at = Some(next_retry_at);
        }
        _ => {}
    }
    Ok(Json(response))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ServiceError> {
    let expected = state
        .config
        .admin_api_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized("admin API is not configured".into()))?;
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("missing admin token".into()))?;
    if provided != expected {
        return Err(ServiceError::Unauthorized("invalid admin token".into()));
    }
    Ok(())
}
