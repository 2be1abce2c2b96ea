//! Provider webhook endpoints.
//!
//! Each endpoint runs its provenance gate first, then hands the payload to
//! the provider adapter and the transition engine. Response policy: 403 for
//! authentication failures, 400 for payloads the adapter cannot read, and
//! 200 for everything after that — including internal errors, which are
//! logged and retried by the sweep rather than surfaced to the provider's
//! redelivery loop.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    adapters::{self, CanonicalNotification, WebhookAction},
    errors::ServiceError,
    provenance::{verify_body_hmac, verify_ordered_digest},
    services::PaymentLookup,
    AppState,
};

const CRYPTOBOT_SIGNATURE_HEADER: &str = "crypto-pay-api-signature";
const MULENPAY_SIGNATURE_HEADER: &str = "sign";

/// YooKassa notification endpoint. Authenticity is source-address based:
/// the resolved client IP must sit inside YooKassa's published ranges.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/yookassa",
    tag = "webhooks",
    request_body = Value,
    responses(
        (status = 200, description = "Notification accepted"),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 403, description = "Source address rejected", body = crate::errors::ErrorResponse)
    )
)]
pub async fn yookassa(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let chain = forwarded_chain(&headers);
    let chain_refs: Vec<&str> = chain.iter().map(String::as_str).collect();
    let source = state
        .yookassa_gate
        .check(peer.ip(), &chain_refs)
        .map_err(|rejection| {
            warn!(peer = %peer, rejection = %rejection, "yookassa notification rejected");
            ServiceError::Forbidden(rejection.to_string())
        })?;

    let payload = parse_body(&body)?;
    let notification = adapters::yookassa::parse(&payload)
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
    info!(source = %source, "yookassa notification accepted");
    Ok(process(&state, notification).await)
}

/// CryptoBot endpoint. Authenticity is an HMAC of the raw body keyed with
/// the hash of the API token.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/cryptobot",
    tag = "webhooks",
    request_body = Value,
    responses(
        (status = 200, description = "Notification accepted"),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 403, description = "Signature rejected", body = crate::errors::ErrorResponse)
    )
)]
pub async fn cryptobot(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let token = state
        .config
        .cryptobot_token
        .as_deref()
        .ok_or_else(|| ServiceError::Forbidden("cryptobot webhook is not configured".into()))?;
    let provided = header_str(&headers, CRYPTOBOT_SIGNATURE_HEADER);
    verify_body_hmac(&body, token, provided).map_err(|rejection| {
        warn!(rejection = %rejection, "cryptobot notification rejected");
        ServiceError::Forbidden(rejection.to_string())
    })?;

    let payload = parse_body(&body)?;
    let notification = adapters::cryptobot::parse(&payload)
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
    Ok(process(&state, notification).await)
}

/// MulenPay endpoint. Authenticity is a SHA-256 digest over an ordered
/// field sequence joined with the shared secret.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/mulenpay",
    tag = "webhooks",
    request_body = Value,
    responses(
        (status = 200, description = "Notification accepted"),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 403, description = "Signature rejected", body = crate::errors::ErrorResponse)
    )
)]
pub async fn mulenpay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let secret = state
        .config
        .mulenpay_secret
        .as_deref()
        .ok_or_else(|| ServiceError::Forbidden("mulenpay webhook is not configured".into()))?;

    let payload = parse_body(&body)?;
    let fields = adapters::mulenpay::signature_fields(&payload);
    let field_refs: Vec<&str> = fields.iter().map(String::as_str).collect();
    let provided = header_str(&headers, MULENPAY_SIGNATURE_HEADER);
    verify_ordered_digest(&field_refs, secret, provided).map_err(|rejection| {
        warn!(rejection = %rejection, "mulenpay notification rejected");
        ServiceError::Forbidden(rejection.to_string())
    })?;

    let notification = adapters::mulenpay::parse(&payload)
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
    Ok(process(&state, notification).await)
}

/// Post-authentication pipeline shared by all providers. Always returns
/// 200; the body reports what happened for the provider's logs.
async fn process(state: &AppState, notification: CanonicalNotification) -> Json<Value> {
    let provider = notification.provider;

    if notification.action == WebhookAction::Ignore {
        return Json(json!({"status": "ignored"}));
    }

    let lookup = match (&notification.order_id, &notification.external_id) {
        (Some(order_id), external_id) => {
            let mut lookup = PaymentLookup::by_order_id(provider, order_id.clone());
            lookup.resolved_external_id = external_id.clone();
            lookup
        }
        (None, Some(external_id)) => PaymentLookup::by_external_id(provider, external_id.clone()),
        (None, None) => {
            warn!(provider, "notification carries no payment identifiers");
            return Json(json!({"status": "unmatched"}));
        }
    };

    let result = match notification.action {
        WebhookAction::MarkPaid => state.payments.mark_paid(&lookup).await,
        WebhookAction::MarkFailed => state.payments.mark_failed(&lookup).await,
        WebhookAction::Ignore => unreachable!("handled above"),
    };

    match result {
        Ok(outcome) => {
            if outcome.should_run_side_effects() {
                if let Some(snapshot) = outcome.snapshot() {
                    state.orchestrator.run(snapshot).await;
                }
            }
            let status = match &outcome {
                crate::services::TransitionOutcome::NotFound => {
                    warn!(provider, ?lookup, "no ledger row matched notification");
                    "not_found"
                }
                crate::services::TransitionOutcome::AlreadyFinal(_) => "already_final",
                crate::services::TransitionOutcome::PaidNow(_) => "paid",
                crate::services::TransitionOutcome::FailedNow(_) => "failed",
            };
            Json(json!({"status": status}))
        }
        Err(err) => {
            // Redelivery cannot fix an internal fault, so acknowledge and
            // let the sweep catch anything left behind.
            error!(provider, error = %err, "notification processing errored");
            Json(json!({"status": "error"}))
        }
    }
}

fn parse_body(body: &Bytes) -> Result<Value, ServiceError> {
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadRequest(format!("body is not valid JSON: {}", e)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn forwarded_chain(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}
