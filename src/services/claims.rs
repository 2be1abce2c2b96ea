//! The claim → execute → release protocol shared by all side-effect
//! workflows.
//!
//! Mutual exclusion is transaction-scoped: the claim read takes a row lock,
//! so concurrent claimants serialize and the loser observes the winner's
//! lease. Webhook delivery may be retried from another process or host at
//! any time, so no in-process lock can be relied upon. A crashed executor
//! leaves a lease that expires by TTL instead of an explicit unlock.

use crate::{
    entities::payment,
    errors::ServiceError,
    metadata::{self, Workflow},
    services::payments::PaymentSnapshot,
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, QuerySelect, Set, TransactionTrait,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Lease age beyond which a claim is considered abandoned.
pub const CLAIM_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now owns the workflow for this row.
    Claimed {
        attempts: u32,
        snapshot: PaymentSnapshot,
    },
    /// Terminal marker already set; nothing left to do, ever.
    AlreadyApplied,
    /// Another executor holds a fresh lease.
    InProgress,
    /// A scheduled retry time has not arrived yet.
    RetryWait { until: DateTime<Utc> },
    NotFound,
}

/// Per-workflow claim/release operations over the payment metadata bag.
pub struct ClaimStore {
    db: Arc<DatabaseConnection>,
}

impl ClaimStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Try to take the lease for `(payment, workflow)`.
    ///
    /// When `honor_next_retry` is false (manual operator retries) a future
    /// `NextRetryAt` is ignored; the applied marker and a fresh lease still
    /// block the claim.
    pub async fn claim(
        &self,
        payment_id: Uuid,
        workflow: Workflow,
        honor_next_retry: bool,
    ) -> Result<ClaimOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        // SELECT ... FOR UPDATE: a concurrent claimant blocks on this read
        // until commit, then sees the lease written below.
        let row = match payment::Entity::find_by_id(payment_id)
            .lock_exclusive()
            .one(&txn)
            .await?
        {
            Some(row) => row,
            None => {
                txn.commit().await?;
                return Ok(ClaimOutcome::NotFound);
            }
        };

        let now = Utc::now();
        let meta = &row.metadata;

        if metadata::get_time(meta, &workflow.applied_at_key()).is_some() {
            txn.commit().await?;
            return Ok(ClaimOutcome::AlreadyApplied);
        }

        if let Some(lease) = metadata::get_time(meta, &workflow.in_progress_at_key()) {
            if now - lease < Duration::minutes(CLAIM_TTL_MINUTES) {
                txn.commit().await?;
                return Ok(ClaimOutcome::InProgress);
            }
            debug!(
                payment_id = %payment_id,
                workflow = workflow.ns(),
                lease_age_secs = (now - lease).num_seconds(),
                "reclaiming expired lease"
            );
        }

        if honor_next_retry {
            if let Some(until) = metadata::get_time(meta, &workflow.next_retry_at_key()) {
                if until > now {
                    txn.commit().await?;
                    return Ok(ClaimOutcome::RetryWait { until });
                }
            }
        }

        let attempts = metadata::get_u32(meta, &workflow.attempts_key()) + 1;
        let mut updated = row.metadata.clone();
        metadata::set_time(&mut updated, &workflow.in_progress_at_key(), now);
        metadata::set_value(&mut updated, &workflow.attempts_key(), json!(attempts));

        let snapshot = PaymentSnapshot::from(payment::Model {
            metadata: updated.clone(),
            ..row.clone()
        });

        payment::ActiveModel {
            id: Set(row.id),
            metadata: Set(updated),
            ..Default::default()
        }
        .update(&txn)
        .await?;
        txn.commit().await?;

        Ok(ClaimOutcome::Claimed { attempts, snapshot })
    }

    /// Mark the workflow applied and drop the lease. `finalize` may record
    /// workflow-specific terminal fields (e.g. the receipt identifier).
    pub async fn release_success<F>(
        &self,
        payment_id: Uuid,
        workflow: Workflow,
        finalize: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Value),
    {
        self.release(payment_id, workflow, |meta| {
            metadata::set_time(meta, &workflow.applied_at_key(), Utc::now());
            metadata::clear(meta, &workflow.last_error_key());
            metadata::clear(meta, &workflow.next_retry_at_key());
            finalize(meta);
        })
        .await
    }

    /// Record the failure and drop the lease, leaving the applied marker
    /// unset so a later attempt may retry.
    pub async fn release_failure(
        &self,
        payment_id: Uuid,
        workflow: Workflow,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), ServiceError> {
        self.release(payment_id, workflow, |meta| {
            metadata::set_value(
                meta,
                &workflow.last_error_key(),
                Value::String(error.to_string()),
            );
            if let Some(at) = next_retry_at {
                metadata::set_time(meta, &workflow.next_retry_at_key(), at);
            }
        })
        .await
    }

    async fn release<F>(
        &self,
        payment_id: Uuid,
        workflow: Workflow,
        mutate: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Value),
    {
        let txn = self.db.begin().await?;

        // Re-read the current bag under the same row lock rather than
        // trusting any in-memory copy: another workflow may have written
        // its own keys since the claim.
        let row = match payment::Entity::find_by_id(payment_id)
            .lock_exclusive()
            .one(&txn)
            .await?
        {
            Some(row) => row,
            None => {
                txn.commit().await?;
                return Err(ServiceError::NotFound(format!(
                    "payment {} disappeared during {} release",
                    payment_id,
                    workflow.ns()
                )));
            }
        };

        let mut updated = row.metadata.clone();
        metadata::clear(&mut updated, &workflow.in_progress_at_key());
        mutate(&mut updated);

        payment::ActiveModel {
            id: Set(row.id),
            metadata: Set(updated),
            ..Default::default()
        }
        .update(&txn)
        .await?;
        txn.commit().await?;
        Ok(())
    }
}
