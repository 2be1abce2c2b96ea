//! Tax receipt filing with bounded exponential retry.
//!
//! Receipts exist only for YooKassa card payments (the other providers
//! settle outside the self-employed tax regime). Filing runs under the
//! shared claim protocol in the `nalogoReceipt` namespace; scheduling state
//! lives entirely in the payment's metadata bag so any process can pick up
//! where another left off.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    adapters,
    clients::{CreateReceiptRequest, NalogoClient},
    entities::{payment, payment::PaymentStatus},
    errors::ServiceError,
    metadata::{self, Workflow},
    services::claims::{ClaimOutcome, ClaimStore},
};

/// Terminal metadata fields written once a receipt exists.
pub const RECEIPT_UUID_KEY: &str = "nalogoReceiptUuid";
pub const RECEIPT_URL_KEY: &str = "nalogoReceiptUrl";

const BACKOFF_FLOOR_SECS: i64 = 60;
const BACKOFF_CEILING_SECS: i64 = 6 * 60 * 60;
const BACKOFF_EXP_CAP: u32 = 8;
const BATCH_PAGE_SIZE: u64 = 100;

/// Delay before the next filing attempt. Doubles per completed attempt from
/// a base of 60 s (transient failures) or 600 s (permanent-looking ones,
/// which still retry in case credentials get fixed); the exponent caps at 8
/// and the delay saturates at the 6 h ceiling.
pub fn backoff(attempts: u32, retryable: bool) -> Duration {
    let base: i64 = if retryable { 60 } else { 600 };
    let exp = attempts.saturating_sub(1);
    let secs = if exp >= BACKOFF_EXP_CAP {
        BACKOFF_CEILING_SECS
    } else {
        (base << exp).clamp(BACKOFF_FLOOR_SECS, BACKOFF_CEILING_SECS)
    };
    Duration::seconds(secs)
}

#[derive(Debug, Clone)]
pub enum ReceiptOutcome {
    Created { uuid: String },
    AlreadyCreated,
    InProgress,
    RetryWait { until: DateTime<Utc> },
    Failed { error: String, next_retry_at: DateTime<Utc> },
    NotPaidYookassa,
    NotConfigured,
    NotFound,
}

impl ReceiptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::AlreadyCreated => "already_created",
            Self::InProgress => "in_progress",
            Self::RetryWait { .. } => "retry_wait",
            Self::Failed { .. } => "failed",
            Self::NotPaidYookassa => "not_paid_yookassa",
            Self::NotConfigured => "not_configured",
            Self::NotFound => "not_found",
        }
    }
}

/// Counters for one sweep pass.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SweepSummary {
    pub scanned: u64,
    pub processed: u64,
    pub created: u64,
    pub failed: u64,
}

pub struct ReceiptService {
    db: Arc<DatabaseConnection>,
    claims: Arc<ClaimStore>,
    client: Option<Arc<dyn NalogoClient>>,
    item_delay: StdDuration,
}

impl ReceiptService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        claims: Arc<ClaimStore>,
        client: Option<Arc<dyn NalogoClient>>,
        item_delay: StdDuration,
    ) -> Self {
        Self {
            db,
            claims,
            client,
            item_delay,
        }
    }

    /// File the receipt for one payment. `force` bypasses a scheduled
    /// `NextRetryAt`; the applied marker and a live lease still hold.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn process_one(
        &self,
        payment_id: Uuid,
        force: bool,
    ) -> Result<ReceiptOutcome, ServiceError> {
        let Some(client) = &self.client else {
            return Ok(ReceiptOutcome::NotConfigured);
        };

        // Eligibility first, before any lease is taken: non-YooKassa and
        // unpaid rows never file and must not accumulate attempts.
        let row = match payment::Entity::find_by_id(payment_id).one(&*self.db).await? {
            Some(row) => row,
            None => return Ok(ReceiptOutcome::NotFound),
        };
        if row.status != PaymentStatus::Paid.as_str() || row.provider != adapters::yookassa::PROVIDER
        {
            return Ok(ReceiptOutcome::NotPaidYookassa);
        }

        let claimed = self
            .claims
            .claim(payment_id, Workflow::NalogoReceipt, !force)
            .await?;
        let (attempts, snapshot) = match claimed {
            ClaimOutcome::Claimed { attempts, snapshot } => (attempts, snapshot),
            ClaimOutcome::AlreadyApplied => return Ok(ReceiptOutcome::AlreadyCreated),
            ClaimOutcome::InProgress => return Ok(ReceiptOutcome::InProgress),
            ClaimOutcome::RetryWait { until } => return Ok(ReceiptOutcome::RetryWait { until }),
            ClaimOutcome::NotFound => return Ok(ReceiptOutcome::NotFound),
        };

        let name = metadata::get_str(&snapshot.metadata, "receiptName")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Оплата заказа {}", snapshot.order_id));
        let request = CreateReceiptRequest {
            name,
            amount_rub: snapshot.amount,
            quantity: 1,
        };

        match client.create_receipt(&request).await {
            Ok(receipt) => {
                let uuid = receipt.uuid.clone();
                self.claims
                    .release_success(payment_id, Workflow::NalogoReceipt, |meta| {
                        metadata::set_value(meta, RECEIPT_UUID_KEY, Value::String(receipt.uuid));
                        if let Some(url) = receipt.print_url {
                            metadata::set_value(meta, RECEIPT_URL_KEY, Value::String(url));
                        }
                    })
                    .await?;
                info!(receipt_uuid = %uuid, attempts, "receipt filed");
                Ok(ReceiptOutcome::Created { uuid })
            }
            Err(err) => {
                let next_retry_at = Utc::now() + backoff(attempts, err.retryable);
                warn!(
                    error = %err,
                    retryable = err.retryable,
                    attempts,
                    next_retry_at = %next_retry_at,
                    "receipt filing failed"
                );
                self.claims
                    .release_failure(
                        payment_id,
                        Workflow::NalogoReceipt,
                        &err.to_string(),
                        Some(next_retry_at),
                    )
                    .await?;
                Ok(ReceiptOutcome::Failed {
                    error: err.to_string(),
                    next_retry_at,
                })
            }
        }
    }

    /// One sweep pass: pick up to `limit` paid YooKassa rows with no receipt
    /// yet, oldest first, and run each through `process_one`. Scheduling
    /// (retry-wait, in-progress) is enforced per item by the claim.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, limit: u64) -> Result<SweepSummary, ServiceError> {
        let mut summary = SweepSummary::default();
        if self.client.is_none() || limit == 0 {
            return Ok(summary);
        }

        let mut picked: Vec<Uuid> = Vec::new();
        // Compound (paid_at, id) cursor: paid_at alone is not unique, and a
        // strict paid_at comparison would skip rows tied with the last one
        // on a page boundary.
        let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;
        'scan: loop {
            let mut query = payment::Entity::find()
                .filter(payment::Column::Status.eq(PaymentStatus::Paid.as_str()))
                .filter(payment::Column::Provider.eq(adapters::yookassa::PROVIDER))
                .order_by_asc(payment::Column::PaidAt)
                .order_by_asc(payment::Column::Id)
                .limit(BATCH_PAGE_SIZE);
            if let Some((after_at, after_id)) = cursor {
                query = query.filter(
                    Condition::any()
                        .add(payment::Column::PaidAt.gt(after_at))
                        .add(
                            Condition::all()
                                .add(payment::Column::PaidAt.eq(after_at))
                                .add(payment::Column::Id.gt(after_id)),
                        ),
                );
            }
            let rows = query.all(&*self.db).await?;
            if rows.is_empty() {
                break;
            }
            cursor = rows
                .last()
                .and_then(|row| row.paid_at.map(|at| (at, row.id)));

            for row in rows {
                summary.scanned += 1;
                // The receipt field is inside the JSON bag, so the filter
                // happens here rather than in SQL.
                if metadata::get_str(&row.metadata, RECEIPT_UUID_KEY).is_some() {
                    continue;
                }
                picked.push(row.id);
                if picked.len() as u64 >= limit {
                    break 'scan;
                }
            }
            if cursor.is_none() {
                break;
            }
        }

        let mut first = true;
        for payment_id in picked {
            if !first && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
            first = false;

            summary.processed += 1;
            match self.process_one(payment_id, false).await {
                Ok(ReceiptOutcome::Created { .. }) => summary.created += 1,
                Ok(ReceiptOutcome::Failed { .. }) => summary.failed += 1,
                Ok(_) => {}
                Err(err) => {
                    summary.failed += 1;
                    warn!(payment_id = %payment_id, error = %err, "sweep item errored");
                }
            }
        }
        Ok(summary)
    }
}
