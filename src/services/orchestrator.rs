//! Post-payment side effects: entitlement activation, referral accrual,
//! and tax receipt filing.
//!
//! Runs after every PAID observation, including webhook replays, because a
//! prior run may have died between the status flip and any of the effects.
//! Nothing here can undo PAID; failures are recorded (and retried where a
//! workflow exists) but the ledger row stays final.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::{
    clients::{EntitlementClient, ReferralClient},
    metadata::Workflow,
    services::{
        claims::{ClaimOutcome, ClaimStore},
        payments::PaymentSnapshot,
        receipts::ReceiptService,
    },
};

pub struct PostPaymentOrchestrator {
    claims: Arc<ClaimStore>,
    entitlement: Arc<dyn EntitlementClient>,
    referral: Arc<dyn ReferralClient>,
    receipts: Arc<ReceiptService>,
}

impl PostPaymentOrchestrator {
    pub fn new(
        claims: Arc<ClaimStore>,
        entitlement: Arc<dyn EntitlementClient>,
        referral: Arc<dyn ReferralClient>,
        receipts: Arc<ReceiptService>,
    ) -> Self {
        Self {
            claims,
            entitlement,
            referral,
            receipts,
        }
    }

    /// Run every applicable side effect for a PAID snapshot. Each effect is
    /// independent; one failing never blocks the others.
    #[instrument(skip(self, snapshot), fields(payment_id = %snapshot.id))]
    pub async fn run(&self, snapshot: &PaymentSnapshot) {
        if !snapshot.is_paid() {
            return;
        }

        self.activate_entitlement(snapshot).await;
        self.record_referral(snapshot).await;

        match self.receipts.process_one(snapshot.id, false).await {
            Ok(outcome) => debug!(outcome = outcome.as_str(), "receipt step finished"),
            Err(err) => error!(error = %err, "receipt step errored"),
        }
    }

    /// Activate the purchased tariff under the `entitlement` claim.
    /// Tariff-less payments are balance top-ups and have nothing to activate.
    async fn activate_entitlement(&self, snapshot: &PaymentSnapshot) {
        let Some(tariff_id) = snapshot.tariff_id else {
            return;
        };

        let claimed = match self
            .claims
            .claim(snapshot.id, Workflow::Entitlement, true)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "entitlement claim errored");
                return;
            }
        };
        match claimed {
            ClaimOutcome::Claimed { attempts, .. } => {
                match self
                    .entitlement
                    .activate(snapshot.account_id, tariff_id, snapshot.id)
                    .await
                {
                    Ok(()) => {
                        if let Err(err) = self
                            .claims
                            .release_success(snapshot.id, Workflow::Entitlement, |_| {})
                            .await
                        {
                            error!(error = %err, "entitlement release errored");
                        } else {
                            info!(%tariff_id, attempts, "entitlement applied");
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, attempts, "entitlement activation failed");
                        if let Err(release_err) = self
                            .claims
                            .release_failure(
                                snapshot.id,
                                Workflow::Entitlement,
                                &err.to_string(),
                                None,
                            )
                            .await
                        {
                            error!(error = %release_err, "entitlement failure release errored");
                        }
                    }
                }
            }
            ClaimOutcome::AlreadyApplied => {
                debug!("entitlement already applied");
            }
            ClaimOutcome::InProgress | ClaimOutcome::RetryWait { .. } => {
                debug!("entitlement claim held elsewhere");
            }
            ClaimOutcome::NotFound => {
                warn!("payment row vanished before entitlement claim");
            }
        }
    }

    /// Referral accrual carries no claim: duplicate notifications are
    /// deduplicated downstream by payment id, and a lost one only costs a
    /// bonus.
    async fn record_referral(&self, snapshot: &PaymentSnapshot) {
        if let Err(err) = self
            .referral
            .record_purchase(
                snapshot.account_id,
                snapshot.id,
                snapshot.amount,
                &snapshot.currency,
            )
            .await
        {
            warn!(error = %err, "referral accrual failed");
        }
    }
}
