//! Outbound integrations: entitlement backend, referral ledger, and the
//! tax-receipt service with its SOCKS5 fallback transport.

pub mod entitlement;
pub mod nalogo;
pub mod referral;
pub mod socks;

pub use entitlement::{DisabledEntitlementClient, EntitlementClient, HttpEntitlementClient};
pub use nalogo::{
    CreateReceiptRequest, DirectTransport, LknpdClient, NalogoClient, NalogoError, Receipt,
    TunnelTransport,
};
pub use referral::{HttpReferralClient, NoopReferralClient, ReferralClient};
pub use socks::{SocksProxy, TunnelError};
