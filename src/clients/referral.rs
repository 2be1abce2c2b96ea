//! Referral ledger client. Reward accrual is fire-and-forget: a lost
//! notification costs a referral bonus, never a payment.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

#[async_trait]
pub trait ReferralClient: Send + Sync {
    async fn record_purchase(
        &self,
        account_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<(), reqwest::Error>;
}

pub struct HttpReferralClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpReferralClient {
    pub fn new(base_url: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReferralClient for HttpReferralClient {
    async fn record_purchase(
        &self,
        account_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<(), reqwest::Error> {
        self.http
            .post(format!("{}/v1/referrals/purchase", self.base_url))
            .json(&json!({
                "account_id": account_id,
                "payment_id": payment_id,
                "amount": amount,
                "currency": currency,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct NoopReferralClient;

#[async_trait]
impl ReferralClient for NoopReferralClient {
    async fn record_purchase(
        &self,
        _account_id: Uuid,
        _payment_id: Uuid,
        _amount: Decimal,
        _currency: &str,
    ) -> Result<(), reqwest::Error> {
        Ok(())
    }
}
