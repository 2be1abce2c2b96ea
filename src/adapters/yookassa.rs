use serde_json::Value;

use super::{first_string, AdapterError, CanonicalNotification, WebhookAction};

pub const PROVIDER: &str = "yookassa";

/// Translate a YooKassa notification body into the canonical triple.
///
/// The interesting parts live under `object`: the provider-assigned payment
/// id, the status, and our order id echoed back through `metadata`.
pub fn parse(body: &Value) -> Result<CanonicalNotification, AdapterError> {
    let object = body
        .get("object")
        .filter(|v| v.is_object())
        .ok_or_else(|| AdapterError::BadPayload {
            provider: PROVIDER,
            detail: "missing object".to_string(),
        })?;

    let event = first_string(body, &["event", "type"]).unwrap_or_default();
    let status = first_string(object, &["status"]).unwrap_or_default();

    let action = match (event.as_str(), status.as_str()) {
        ("payment.succeeded", _) | (_, "succeeded") => WebhookAction::MarkPaid,
        ("payment.canceled", _) | (_, "canceled") => WebhookAction::MarkFailed,
        _ => WebhookAction::Ignore,
    };

    let order_id = object
        .get("metadata")
        .map(|meta| first_string(meta, &["order_id", "orderId", "orderNumber"]))
        .unwrap_or(None)
        .or_else(|| first_string(object, &["description"]));

    Ok(CanonicalNotification {
        provider: PROVIDER,
        order_id,
        external_id: first_string(object, &["id", "payment_id"]),
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn succeeded_event_maps_to_mark_paid() {
        let body = json!({
            "event": "payment.succeeded",
            "object": {
                "id": "2d7f4b0e-000f-5000-8000-1a2b3c4d5e6f",
                "status": "succeeded",
                "metadata": {"order_id": "X1"}
            }
        });
        let parsed = parse(&body).unwrap();
        assert_eq!(parsed.action, WebhookAction::MarkPaid);
        assert_eq!(parsed.order_id.as_deref(), Some("X1"));
        assert_eq!(
            parsed.external_id.as_deref(),
            Some("2d7f4b0e-000f-5000-8000-1a2b3c4d5e6f")
        );
    }

    #[test]
    fn canceled_event_maps_to_mark_failed() {
        let body = json!({
            "event": "payment.canceled",
            "object": {"id": "p-1", "status": "canceled", "metadata": {"orderId": "X2"}}
        });
        let parsed = parse(&body).unwrap();
        assert_eq!(parsed.action, WebhookAction::MarkFailed);
        assert_eq!(parsed.order_id.as_deref(), Some("X2"));
    }

    #[test]
    fn waiting_for_capture_is_ignored() {
        let body = json!({
            "event": "payment.waiting_for_capture",
            "object": {"id": "p-2", "status": "waiting_for_capture"}
        });
        assert_eq!(parse(&body).unwrap().action, WebhookAction::Ignore);
    }

    #[test]
    fn missing_object_is_rejected() {
        assert!(parse(&json!({"event": "payment.succeeded"})).is_err());
    }
}
