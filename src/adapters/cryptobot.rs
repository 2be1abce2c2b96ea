use serde_json::Value;

use super::{first_string, AdapterError, CanonicalNotification, WebhookAction};

pub const PROVIDER: &str = "cryptobot";

/// Translate a CryptoBot `invoice_paid` update into the canonical triple.
/// The order id travels in the invoice's free-form payload field; older API
/// revisions used `hidden_message`.
pub fn parse(body: &Value) -> Result<CanonicalNotification, AdapterError> {
    let update_type = first_string(body, &["update_type"]).unwrap_or_default();
    let invoice = body
        .get("payload")
        .filter(|v| v.is_object())
        .ok_or_else(|| AdapterError::BadPayload {
            provider: PROVIDER,
            detail: "missing payload".to_string(),
        })?;

    let status = first_string(invoice, &["status"]).unwrap_or_default();
    let action = if update_type == "invoice_paid" || status == "paid" {
        WebhookAction::MarkPaid
    } else if status == "expired" {
        WebhookAction::MarkFailed
    } else {
        WebhookAction::Ignore
    };

    Ok(CanonicalNotification {
        provider: PROVIDER,
        order_id: first_string(invoice, &["payload", "hidden_message", "custom"]),
        external_id: first_string(invoice, &["invoice_id", "id"]),
        action,
    })
}
