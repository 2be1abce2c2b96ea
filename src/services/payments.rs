use crate::{
    entities::{account, payment, payment::PaymentStatus},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Keys a notification may carry to locate its ledger row. Resolution order:
/// internal id, then order id, then (provider, external id); first match
/// wins. A provider mismatch on an id-based match is treated as not-found so
/// ids can never collide across providers.
#[derive(Debug, Clone, Default)]
pub struct PaymentLookup {
    pub payment_id: Option<Uuid>,
    pub order_id: Option<String>,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    /// Newly-learned provider transaction id to persist on transition.
    pub resolved_external_id: Option<String>,
}

impl PaymentLookup {
    pub fn by_order_id(provider: &str, order_id: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.to_string()),
            order_id: Some(order_id.into()),
            ..Default::default()
        }
    }

    pub fn by_external_id(provider: &str, external_id: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.to_string()),
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }
}

/// Read-only view of a ledger row handed to callers and side-effect
/// workflows.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentSnapshot {
    pub id: Uuid,
    pub order_id: String,
    pub account_id: Uuid,
    pub provider: String,
    pub external_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub tariff_id: Option<Uuid>,
    pub status: String,
    pub metadata: Value,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentSnapshot {
    pub fn is_paid(&self) -> bool {
        self.status == PaymentStatus::Paid.as_str()
    }
}

impl From<payment::Model> for PaymentSnapshot {
    fn from(model: payment::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            account_id: model.account_id,
            provider: model.provider,
            external_id: model.external_id,
            amount: model.amount,
            currency: model.currency,
            tariff_id: model.tariff_id,
            status: model.status,
            metadata: model.metadata,
            paid_at: model.paid_at,
        }
    }
}

/// Result of a transition attempt. `AlreadyFinal` is not an error: it is the
/// expected outcome of concurrent or repeated webhook delivery.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    NotFound,
    AlreadyFinal(PaymentSnapshot),
    PaidNow(PaymentSnapshot),
    FailedNow(PaymentSnapshot),
}

impl TransitionOutcome {
    /// Whether post-payment side effects should run. Both a fresh PAID
    /// transition and an already-PAID replay qualify: a prior attempt may
    /// have crashed after the status flip but before side effects completed.
    pub fn should_run_side_effects(&self) -> bool {
        match self {
            TransitionOutcome::PaidNow(_) => true,
            TransitionOutcome::AlreadyFinal(snapshot) => snapshot.is_paid(),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Option<&PaymentSnapshot> {
        match self {
            TransitionOutcome::AlreadyFinal(s)
            | TransitionOutcome::PaidNow(s)
            | TransitionOutcome::FailedNow(s) => Some(s),
            TransitionOutcome::NotFound => None,
        }
    }
}

/// The only component allowed to mutate a payment's status, paid-at stamp,
/// external id, and the owning account balance.
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, lookup))]
    pub async fn mark_paid(&self, lookup: &PaymentLookup) -> Result<TransitionOutcome, ServiceError> {
        self.transition(lookup, PaymentStatus::Paid).await
    }

    #[instrument(skip(self, lookup))]
    pub async fn mark_failed(
        &self,
        lookup: &PaymentLookup,
    ) -> Result<TransitionOutcome, ServiceError> {
        self.transition(lookup, PaymentStatus::Failed).await
    }

    pub async fn get_snapshot(&self, id: Uuid) -> Result<Option<PaymentSnapshot>, ServiceError> {
        Ok(payment::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(PaymentSnapshot::from))
    }

    async fn transition(
        &self,
        lookup: &PaymentLookup,
        target: PaymentStatus,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let row = match Self::find(&txn, lookup).await? {
            Some(row) => row,
            None => {
                txn.commit().await?;
                return Ok(TransitionOutcome::NotFound);
            }
        };

        let now = Utc::now();
        let mut update = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(target.as_str()))
            .filter(payment::Column::Id.eq(row.id))
            // The single ordering guarantee: only one writer ever observes a
            // pending row, no matter which process gets there first.
            .filter(payment::Column::Status.eq(PaymentStatus::Pending.as_str()));

        if target == PaymentStatus::Paid {
            update = update.col_expr(payment::Column::PaidAt, Expr::value(Some(now)));
        }
        if let Some(external_id) = lookup
            .resolved_external_id
            .as_ref()
            .or(lookup.external_id.as_ref())
        {
            update = update.col_expr(
                payment::Column::ExternalId,
                Expr::value(Some(external_id.clone())),
            );
        }

        let result = update.exec(&txn).await?;
        if result.rows_affected == 0 {
            // A racing notification already finalized the row; report the
            // current state instead of failing.
            txn.commit().await?;
            let fresh = payment::Entity::find_by_id(row.id).one(&*self.db).await?;
            return Ok(match fresh {
                Some(model) => TransitionOutcome::AlreadyFinal(model.into()),
                None => TransitionOutcome::NotFound,
            });
        }

        // Balance crediting happens in the same transaction as the status
        // flip, and only for payments with no linked tariff: tariff-linked
        // payments are rewarded through entitlement activation instead.
        if target == PaymentStatus::Paid && row.tariff_id.is_none() {
            account::Entity::update_many()
                .col_expr(
                    account::Column::Balance,
                    Expr::col(account::Column::Balance).add(Expr::val(row.amount)),
                )
                .col_expr(account::Column::UpdatedAt, Expr::value(Some(now)))
                .filter(account::Column::Id.eq(row.account_id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        let fresh = payment::Entity::find_by_id(row.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} vanished", row.id)))?;
        let snapshot = PaymentSnapshot::from(fresh);

        info!(
            payment_id = %snapshot.id,
            order_id = %snapshot.order_id,
            provider = %snapshot.provider,
            status = %snapshot.status,
            "payment transitioned"
        );

        Ok(match target {
            PaymentStatus::Paid => TransitionOutcome::PaidNow(snapshot),
            PaymentStatus::Failed => TransitionOutcome::FailedNow(snapshot),
            PaymentStatus::Pending => unreachable!("pending is never a transition target"),
        })
    }

    async fn find<C: ConnectionTrait>(
        conn: &C,
        lookup: &PaymentLookup,
    ) -> Result<Option<payment::Model>, sea_orm::DbErr> {
        if let Some(id) = lookup.payment_id {
            let found = payment::Entity::find_by_id(id).one(conn).await?;
            return Ok(Self::check_provider(found, lookup));
        }

        if let Some(order_id) = &lookup.order_id {
            let found = payment::Entity::find()
                .filter(payment::Column::OrderId.eq(order_id.clone()))
                .one(conn)
                .await?;
            if let Some(row) = Self::check_provider(found, lookup) {
                return Ok(Some(row));
            }
        }

        if let (Some(provider), Some(external_id)) = (&lookup.provider, &lookup.external_id) {
            return payment::Entity::find()
                .filter(payment::Column::Provider.eq(provider.clone()))
                .filter(payment::Column::ExternalId.eq(external_id.clone()))
                .one(conn)
                .await;
        }

        Ok(None)
    }

    fn check_provider(
        found: Option<payment::Model>,
        lookup: &PaymentLookup,
    ) -> Option<payment::Model> {
        match (&found, &lookup.provider) {
            (Some(row), Some(provider)) if &row.provider != provider => None,
            _ => found,
        }
    }
}
