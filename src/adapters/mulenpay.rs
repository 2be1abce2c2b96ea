use serde_json::Value;

use super::{first_string, AdapterError, CanonicalNotification, WebhookAction};

pub const PROVIDER: &str = "mulenpay";

/// Translate a MulenPay callback into the canonical triple. The payload is
/// flat; numeric statuses come from older API revisions (3 = paid,
/// 4 = canceled).
pub fn parse(body: &Value) -> Result<CanonicalNotification, AdapterError> {
    if !body.is_object() {
        return Err(AdapterError::BadPayload {
            provider: PROVIDER,
            detail: "payload is not an object".to_string(),
        });
    }

    let status = first_string(body, &["status", "paymentStatus"]).unwrap_or_default();
    let action = match status.as_str() {
        "success" | "paid" | "3" => WebhookAction::MarkPaid,
        "canceled" | "cancelled" | "error" | "4" => WebhookAction::MarkFailed,
        _ => WebhookAction::Ignore,
    };

    Ok(CanonicalNotification {
        provider: PROVIDER,
        order_id: first_string(body, &["orderId", "order_id", "description"]),
        external_id: first_string(body, &["id", "uuid", "paymentId"]),
        action,
    })
}

/// Ordered field sequence the provider signs: payment id, amount, currency.
/// Used together with the shared secret to recompute the `sign` digest.
pub fn signature_fields(body: &Value) -> Vec<String> {
    ["id", "amount", "currency"]
        .iter()
        .filter_map(|key| first_string(body, &[key]))
        .collect()
}
