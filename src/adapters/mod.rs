//! Provider payload adapters.
//!
//! Each adapter translates one provider's webhook JSON into the canonical
//! notification consumed by the transition engine. Provider payloads are
//! inconsistent across API revisions, so field extraction works through
//! ordered candidate lists (first non-empty spelling wins); the guesswork
//! stays here and never leaks into the ledger contract.

pub mod cryptobot;
pub mod mulenpay;
pub mod yookassa;

use serde_json::Value;
use thiserror::Error;

/// What the notification asks the ledger to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAction {
    MarkPaid,
    MarkFailed,
    /// Status we deliberately do not act on (e.g. "waiting_for_capture").
    Ignore,
}

/// Canonical (orderId | externalId | action) triple extracted from a
/// provider payload.
#[derive(Debug, Clone)]
pub struct CanonicalNotification {
    pub provider: &'static str,
    pub order_id: Option<String>,
    pub external_id: Option<String>,
    pub action: WebhookAction,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed {provider} payload: {detail}")]
    BadPayload {
        provider: &'static str,
        detail: String,
    },
}

/// First non-empty string among candidate key spellings.
pub(crate) fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => continue,
        }
    }
    None
}
