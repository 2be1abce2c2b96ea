//! Client for the lknpd.nalog.ru self-employed income API.
//!
//! The service is only reachable from Russian address space, so the client
//! supports two transports: a plain HTTPS one and a manual SOCKS5 tunnel
//! (see [`crate::clients::socks`]) used as fallback when the direct path is
//! blocked. Errors carry a retryability verdict that drives the receipt
//! retry engine's backoff choice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::socks::{self, SocksProxy};

const API_HOST: &str = "lknpd.nalog.ru";
const API_BASE: &str = "https://lknpd.nalog.ru/api";

/// One line item to file. Amounts are rubles with kopek precision.
#[derive(Debug, Clone)]
pub struct CreateReceiptRequest {
    pub name: String,
    pub amount_rub: Decimal,
    pub quantity: u32,
}

/// A successfully filed receipt.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub uuid: String,
    pub print_url: Option<String>,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct NalogoError {
    pub message: String,
    /// Upstream HTTP status, when the failure was an HTTP response.
    pub status: Option<u16>,
    /// Whether a later attempt can plausibly succeed. Credential rejection
    /// is the one permanent failure; throttling and connectivity are not.
    pub retryable: bool,
}

impl NalogoError {
    pub fn transport(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
            status: None,
            retryable: true,
        }
    }

    pub fn from_status(status: u16, body_excerpt: &str) -> Self {
        let retryable = status != 401 && status != 403;
        Self {
            message: format!("tax service returned {}: {}", status, body_excerpt),
            status: Some(status),
            retryable,
        }
    }
}

/// Filing interface the rest of the crate depends on. Mocked in tests.
#[async_trait]
pub trait NalogoClient: Send + Sync {
    async fn create_receipt(&self, request: &CreateReceiptRequest) -> Result<Receipt, NalogoError>;
}

/// A single HTTPS POST against the tax API, however it is carried.
#[async_trait]
pub trait ReceiptTransport: Send + Sync {
    fn label(&self) -> &'static str;
    async fn post_json(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<(u16, Value), NalogoError>;
}

/// Ordinary HTTPS via the shared connection pool.
pub struct DirectTransport {
    http: reqwest::Client,
}

impl DirectTransport {
    pub fn new(timeout: Duration) -> Result<Self, NalogoError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NalogoError::transport)?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ReceiptTransport for DirectTransport {
    fn label(&self) -> &'static str {
        "direct"
    }

    async fn post_json(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<(u16, Value), NalogoError> {
        let mut request = self.http.post(format!("{}{}", API_BASE, path)).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NalogoError::transport("tax service request timed out")
            } else {
                NalogoError::transport(format!("tax service unreachable: {}", e))
            }
        })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(NalogoError::transport)?;
        let value = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok((status, value))
    }
}

/// Manual SOCKS5 + TLS carrier, used when the direct path is blocked.
pub struct TunnelTransport {
    proxy: Option<SocksProxy>,
    timeout: Duration,
}

impl TunnelTransport {
    pub fn new(proxy: Option<SocksProxy>, timeout: Duration) -> Self {
        Self { proxy, timeout }
    }
}

#[async_trait]
impl ReceiptTransport for TunnelTransport {
    fn label(&self) -> &'static str {
        "tunnel"
    }

    async fn post_json(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<(u16, Value), NalogoError> {
        let payload = serde_json::to_vec(body).map_err(NalogoError::transport)?;
        let response = socks::https_post_json(
            self.proxy.as_ref(),
            API_HOST,
            &format!("/api{}", path),
            bearer,
            &payload,
            self.timeout,
        )
        .await
        .map_err(NalogoError::transport)?;
        let value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
        Ok((response.status, value))
    }
}

/// Authenticates with INN + password and files income receipts. A fresh
/// token is fetched per filing; the API's tokens are short-lived and a
/// filing is rare enough that caching buys nothing.
pub struct LknpdClient {
    inn: String,
    password: String,
    primary: Arc<dyn ReceiptTransport>,
    fallback: Option<Arc<dyn ReceiptTransport>>,
}

impl LknpdClient {
    pub fn new(
        inn: String,
        password: String,
        primary: Arc<dyn ReceiptTransport>,
        fallback: Option<Arc<dyn ReceiptTransport>>,
    ) -> Self {
        Self {
            inn,
            password,
            primary,
            fallback,
        }
    }

    async fn file_via(
        &self,
        transport: &dyn ReceiptTransport,
        request: &CreateReceiptRequest,
    ) -> Result<Receipt, NalogoError> {
        let (status, auth) = transport
            .post_json(
                "/v1/auth/lkfl",
                None,
                &json!({
                    "username": self.inn,
                    "password": self.password,
                    "deviceInfo": device_info(),
                }),
            )
            .await?;
        if !(200..300).contains(&status) {
            return Err(NalogoError::from_status(status, &excerpt(&auth)));
        }
        let token = auth
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| NalogoError::transport("auth response carried no token"))?
            .to_string();

        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let income = json!({
            "operationTime": now,
            "requestTime": now,
            "paymentType": "CASH",
            "totalAmount": request.amount_rub.to_string(),
            "client": {"contactPhone": Value::Null, "displayName": Value::Null,
                       "inn": Value::Null, "incomeType": "FROM_INDIVIDUAL"},
            "services": [{
                "name": request.name,
                "amount": request.amount_rub.to_string(),
                "quantity": request.quantity,
            }],
        });
        let (status, body) = transport
            .post_json("/v1/income", Some(&token), &income)
            .await?;
        if !(200..300).contains(&status) {
            return Err(NalogoError::from_status(status, &excerpt(&body)));
        }

        let uuid = extract_receipt_uuid(&body).ok_or_else(|| {
            NalogoError::transport("income response carried no receipt identifier")
        })?;
        let print_url = Some(format!(
            "{}/v1/receipt/{}/{}/print",
            API_BASE, self.inn, uuid
        ));
        Ok(Receipt { uuid, print_url })
    }
}

#[async_trait]
impl NalogoClient for LknpdClient {
    async fn create_receipt(&self, request: &CreateReceiptRequest) -> Result<Receipt, NalogoError> {
        match self.file_via(self.primary.as_ref(), request).await {
            Ok(receipt) => Ok(receipt),
            Err(err) if err.retryable => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                warn!(
                    transport = self.primary.label(),
                    error = %err,
                    "primary transport failed, retrying through {}",
                    fallback.label()
                );
                self.file_via(fallback.as_ref(), request).await
            }
            Err(err) => Err(err),
        }
    }
}

fn device_info() -> Value {
    json!({
        "sourceDeviceId": Uuid::new_v4().to_string(),
        "sourceType": "WEB",
        "appVersion": "1.0.0",
        "metaDetails": {"userAgent": "Mozilla/5.0"},
    })
}

fn excerpt(body: &Value) -> String {
    let raw = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    raw.chars().take(200).collect()
}

static RECEIPT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/receipt/(?:\d+/)?([0-9a-zA-Z]{6,})/?").unwrap());

/// Find the receipt id wherever the response hid it: a dedicated key, or
/// embedded in a print/link URL. The API has shipped several shapes.
pub fn extract_receipt_uuid(body: &Value) -> Option<String> {
    fn walk(value: &Value, out: &mut Option<String>) {
        if out.is_some() {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if matches!(
                        key.as_str(),
                        "approvedReceiptUuid" | "receiptUuid" | "receiptId" | "uuid"
                    ) {
                        if let Some(s) = child.as_str().filter(|s| !s.is_empty()) {
                            *out = Some(s.to_string());
                            return;
                        }
                    }
                    walk(child, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            Value::String(s) => {
                if s.contains("/receipt/") {
                    if let Some(captures) = RECEIPT_URL_RE.captures(s) {
                        *out = Some(captures[1].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let mut found = None;
    walk(body, &mut found);
    if found.is_none() {
        debug!("no receipt identifier in response body");
    }
    found
}
