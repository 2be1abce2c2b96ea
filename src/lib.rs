//! Payment reconciliation service: webhook intake with provenance gating,
//! an idempotent payment state machine, and post-payment side effects
//! (entitlement activation, referral accrual, tax receipt filing with
//! bounded retry).

pub mod adapters;
pub mod clients;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod migrator;
pub mod openapi;
pub mod provenance;
pub mod services;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::warn;

use crate::{
    clients::{
        nalogo::ReceiptTransport, DirectTransport, DisabledEntitlementClient, EntitlementClient,
        HttpEntitlementClient, HttpReferralClient, LknpdClient, NalogoClient, NoopReferralClient,
        ReferralClient, SocksProxy, TunnelTransport,
    },
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    provenance::IpGate,
    services::{ClaimStore, PaymentService, PostPaymentOrchestrator, ReceiptService},
};

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub payments: Arc<PaymentService>,
    pub receipts: Arc<ReceiptService>,
    pub orchestrator: Arc<PostPaymentOrchestrator>,
    pub yookassa_gate: Arc<IpGate>,
}

impl AppState {
    /// Wire every service from configuration. Collaborator clients degrade
    /// to no-op/disabled implementations when their backends are not
    /// configured.
    pub fn build(db: Arc<DbPool>, config: Arc<AppConfig>) -> Result<Self, ServiceError> {
        let claims = Arc::new(ClaimStore::new(Arc::clone(&db)));
        let payments = Arc::new(PaymentService::new(Arc::clone(&db)));

        let entitlement: Arc<dyn EntitlementClient> = match &config.entitlement_base_url {
            Some(base_url) => Arc::new(
                HttpEntitlementClient::new(
                    base_url.clone(),
                    config.entitlement_api_token.clone(),
                )
                .map_err(|e| ServiceError::InternalError(e.to_string()))?,
            ),
            None => {
                warn!("no entitlement backend configured; tariff activation will fail and retry");
                Arc::new(DisabledEntitlementClient)
            }
        };

        let referral: Arc<dyn ReferralClient> = match &config.referral_base_url {
            Some(base_url) => Arc::new(
                HttpReferralClient::new(base_url.clone())
                    .map_err(|e| ServiceError::InternalError(e.to_string()))?,
            ),
            None => Arc::new(NoopReferralClient),
        };

        let nalogo = build_nalogo_client(&config)?;
        let receipts = Arc::new(ReceiptService::new(
            Arc::clone(&db),
            Arc::clone(&claims),
            nalogo,
            Duration::from_millis(config.receipt_sweep_item_delay_ms),
        ));

        let orchestrator = Arc::new(PostPaymentOrchestrator::new(
            claims,
            entitlement,
            referral,
            Arc::clone(&receipts),
        ));

        let trusted_proxies = AppConfig::split_list(config.trusted_proxy_cidrs.as_deref());
        let extra_subnets = AppConfig::split_list(config.yookassa_extra_subnets.as_deref());
        let yookassa_gate = Arc::new(IpGate::yookassa(&trusted_proxies, &extra_subnets));

        Ok(Self {
            db,
            config,
            payments,
            receipts,
            orchestrator,
            yookassa_gate,
        })
    }
}

fn build_nalogo_client(config: &AppConfig) -> Result<Option<Arc<dyn NalogoClient>>, ServiceError> {
    if !config.nalogo_enabled {
        return Ok(None);
    }
    let (inn, password) = match (&config.nalogo_inn, &config.nalogo_password) {
        (Some(inn), Some(password)) => (inn.clone(), password.clone()),
        _ => {
            return Err(ServiceError::ValidationError(
                "nalogo_enabled requires nalogo_inn and nalogo_password".into(),
            ))
        }
    };
    let timeout = Duration::from_secs(config.nalogo_timeout_secs);

    let primary: Arc<dyn ReceiptTransport> = Arc::new(
        DirectTransport::new(timeout).map_err(|e| ServiceError::InternalError(e.to_string()))?,
    );
    let fallback: Option<Arc<dyn ReceiptTransport>> = match &config.nalogo_proxy {
        Some(raw) => {
            let proxy: SocksProxy = raw
                .parse()
                .map_err(|e: String| ServiceError::ValidationError(format!("nalogo_proxy: {}", e)))?;
            Some(Arc::new(TunnelTransport::new(Some(proxy), timeout)))
        }
        None => None,
    };

    Ok(Some(Arc::new(LknpdClient::new(
        inn, password, primary, fallback,
    ))))
}

/// Routes under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/webhooks/yookassa", post(handlers::webhooks::yookassa))
        .route("/webhooks/cryptobot", post(handlers::webhooks::cryptobot))
        .route("/webhooks/mulenpay", post(handlers::webhooks::mulenpay))
        .route(
            "/admin/receipts/:payment_id/retry",
            post(handlers::admin::retry_receipt),
        )
}

/// The complete application router with middleware stack applied.
pub fn app_router(state: AppState) -> Router {
    let cors = build_cors(&state.config);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

fn build_cors(config: &AppConfig) -> CorsLayer {
    let origins = AppConfig::split_list(config.cors_allowed_origins.as_deref());
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
