use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::GateRejection;

type HmacSha256 = Hmac<Sha256>;

/// Recompute the ordered-field digest used by MulenPay-style providers:
/// SHA-256 over the provider-defined field sequence concatenated with the
/// shared secret, hex-encoded, compared case-insensitively.
pub fn verify_ordered_digest(
    fields: &[&str],
    secret: &str,
    provided: Option<&str>,
) -> Result<(), GateRejection> {
    let provided = provided.ok_or(GateRejection::MissingSignature)?;

    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
    }
    hasher.update(secret.as_bytes());
    let expected = hex::encode(hasher.finalize());

    if expected.eq_ignore_ascii_case(provided.trim()) {
        Ok(())
    } else {
        Err(GateRejection::SignatureMismatch)
    }
}

/// Verify a CryptoBot-style body signature: HMAC-SHA-256 over the raw
/// request body, keyed with SHA-256 of the API token.
pub fn verify_body_hmac(
    body: &[u8],
    token: &str,
    provided_hex: Option<&str>,
) -> Result<(), GateRejection> {
    let provided = provided_hex.ok_or(GateRejection::MissingSignature)?;

    let key = Sha256::digest(token.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| GateRejection::SignatureMismatch)?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected.eq_ignore_ascii_case(provided.trim()) {
        Ok(())
    } else {
        Err(GateRejection::SignatureMismatch)
    }
}
