pub mod receipt_sweep;

pub use receipt_sweep::ReceiptSweeper;
