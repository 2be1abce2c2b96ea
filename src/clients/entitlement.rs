//! Entitlement backend client: activates the purchased tariff for an
//! account after a successful payment.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("entitlement request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("entitlement backend returned {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

#[async_trait]
pub trait EntitlementClient: Send + Sync {
    async fn activate(
        &self,
        account_id: Uuid,
        tariff_id: Uuid,
        payment_id: Uuid,
    ) -> Result<(), EntitlementError>;
}

pub struct HttpEntitlementClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpEntitlementClient {
    pub fn new(base_url: String, api_token: Option<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl EntitlementClient for HttpEntitlementClient {
    async fn activate(
        &self,
        account_id: Uuid,
        tariff_id: Uuid,
        payment_id: Uuid,
    ) -> Result<(), EntitlementError> {
        let mut request = self
            .http
            .post(format!("{}/v1/entitlements/activate", self.base_url))
            .json(&json!({
                "account_id": account_id,
                "tariff_id": tariff_id,
                "payment_id": payment_id,
            }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EntitlementError::Rejected {
                status: status.as_u16(),
                detail: detail.chars().take(200).collect(),
            });
        }
        info!(%account_id, %tariff_id, %payment_id, "entitlement activated");
        Ok(())
    }
}

/// Stand-in when no entitlement backend is configured; always errors so the
/// claim protocol records the failure instead of silently marking applied.
pub struct DisabledEntitlementClient;

#[async_trait]
impl EntitlementClient for DisabledEntitlementClient {
    async fn activate(
        &self,
        _account_id: Uuid,
        _tariff_id: Uuid,
        _payment_id: Uuid,
    ) -> Result<(), EntitlementError> {
        Err(EntitlementError::Rejected {
            status: 503,
            detail: "entitlement backend is not configured".to_string(),
        })
    }
}
