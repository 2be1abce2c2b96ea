pub mod account;
pub mod payment;
