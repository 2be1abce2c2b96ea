//! Webhook authenticity checks applied before any notification is trusted.
//!
//! Two gate styles exist: cryptographic signature recomputation over the
//! payload, and source-address membership in a provider's published ranges
//! resolved through a possibly-spoofable forwarded-for chain. Both fail
//! closed; neither ever mutates the ledger.

pub mod ip;
pub mod signature;

pub use ip::{Cidr, IpGate};
pub use signature::{verify_body_hmac, verify_ordered_digest};

use std::fmt;

/// Why a notification was rejected at the gate. Logged for audit with the
/// provider label and the candidate addresses examined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    MissingSignature,
    SignatureMismatch,
    MalformedChain { entry: String },
    DisallowedSource { resolved: String, candidates: Vec<String> },
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateRejection::MissingSignature => write!(f, "signature header missing"),
            GateRejection::SignatureMismatch => write!(f, "signature mismatch"),
            GateRejection::MalformedChain { entry } => {
                write!(f, "unparseable forwarded-for entry {:?}", entry)
            }
            GateRejection::DisallowedSource {
                resolved,
                candidates,
            } => write!(
                f,
                "source address {} not in allow-list (candidates: {})",
                resolved,
                candidates.join(", ")
            ),
        }
    }
}
