//! Business logic: the payment state machine, the claim protocol, the
//! receipt retry engine, and the post-payment orchestrator.

pub mod claims;
pub mod orchestrator;
pub mod payments;
pub mod receipts;

pub use claims::{ClaimOutcome, ClaimStore, CLAIM_TTL_MINUTES};
pub use orchestrator::PostPaymentOrchestrator;
pub use payments::{PaymentLookup, PaymentService, PaymentSnapshot, TransitionOutcome};
pub use receipts::{backoff, ReceiptOutcome, ReceiptService, SweepSummary};
