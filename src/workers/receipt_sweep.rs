//! Background sweep that files receipts missed by the inline webhook path
//! (crashes, tax-service outages, scheduled retries).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::services::ReceiptService;

/// Owner handle for the sweep task; dropping it without calling
/// [`ReceiptSweeper::shutdown`] detaches the task.
pub struct ReceiptSweeper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReceiptSweeper {
    /// Start the fixed-interval sweep. A tick that arrives while the
    /// previous batch is still running is skipped, not queued.
    pub fn spawn(receipts: Arc<ReceiptService>, interval: Duration, batch_limit: u64) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let busy = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), batch_limit, "receipt sweep started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if busy.swap(true, Ordering::AcqRel) {
                            debug!("previous sweep batch still running, skipping tick");
                            continue;
                        }
                        let receipts = Arc::clone(&receipts);
                        let busy = Arc::clone(&busy);
                        tokio::spawn(async move {
                            match receipts.process_batch(batch_limit).await {
                                Ok(summary) if summary.processed > 0 => info!(
                                    scanned = summary.scanned,
                                    processed = summary.processed,
                                    created = summary.created,
                                    failed = summary.failed,
                                    "sweep batch finished"
                                ),
                                Ok(_) => debug!("sweep batch found nothing to do"),
                                Err(err) => error!(error = %err, "sweep batch errored"),
                            }
                            busy.store(false, Ordering::Release);
                        });
                    }
                    _ = shutdown_rx.changed() => {
                        info!("receipt sweep stopping");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, handle }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}
