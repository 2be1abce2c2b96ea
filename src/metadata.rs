//! Typed access to the payment row's metadata bag.
//!
//! The bag is a JSON object extending the row without schema migrations.
//! Each side-effect workflow owns a namespaced subset of keys and must never
//! read or clear another workflow's keys. Values are validated at read time
//! with safe defaults; absence is never an error.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A named post-payment side effect with its own claim/applied/error
/// key namespace inside the metadata bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Entitlement,
    NalogoReceipt,
}

impl Workflow {
    pub fn ns(&self) -> &'static str {
        match self {
            Workflow::Entitlement => "entitlement",
            Workflow::NalogoReceipt => "nalogoReceipt",
        }
    }

    /// Terminal success marker; once set it is never cleared and blocks all
    /// future attempts at this workflow for the row.
    pub fn applied_at_key(&self) -> String {
        format!("{}AppliedAt", self.ns())
    }

    /// Lease timestamp. A fresh lease blocks concurrent claims; one older
    /// than the TTL is considered abandoned and may be reclaimed.
    pub fn in_progress_at_key(&self) -> String {
        format!("{}InProgressAt", self.ns())
    }

    /// Monotonically non-decreasing attempt counter.
    pub fn attempts_key(&self) -> String {
        format!("{}Attempts", self.ns())
    }

    pub fn last_error_key(&self) -> String {
        format!("{}LastError", self.ns())
    }

    /// Earliest moment a time-deferred retry may run.
    pub fn next_retry_at_key(&self) -> String {
        format!("{}NextRetryAt", self.ns())
    }
}

/// Read a timestamp stored as an RFC 3339 string. Missing or malformed
/// values read as absent.
pub fn get_time(meta: &Value, key: &str) -> Option<DateTime<Utc>> {
    meta.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn get_str<'a>(meta: &'a Value, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(Value::as_str)
}

pub fn get_u32(meta: &Value, key: &str) -> u32 {
    meta.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Set a key, coercing a non-object bag (from older rows) to an object first.
pub fn set_value(meta: &mut Value, key: &str, value: Value) {
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(map) = meta.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

pub fn set_time(meta: &mut Value, key: &str, at: DateTime<Utc>) {
    set_value(meta, key, Value::String(at.to_rfc3339()));
}

pub fn clear(meta: &mut Value, key: &str) {
    if let Some(map) = meta.as_object_mut() {
        map.remove(key);
    }
}
