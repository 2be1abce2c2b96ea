use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a payment attempt. `Pending` is the only mutable
/// state; `Paid` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// One row per payment attempt. Rows are created pending by the payment
/// creation flow and mutated only through the transition engine and the
/// per-workflow claim operations; they are never hard-deleted.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Externally-visible order identifier, unique per attempt
    #[sea_orm(unique)]
    pub order_id: String,

    pub account_id: Uuid,

    /// Provider name ("yookassa", "cryptobot", "mulenpay")
    pub provider: String,

    /// Provider-assigned transaction id; may be learned late from a webhook
    pub external_id: Option<String>,

    pub amount: Decimal,
    pub currency: String,

    /// Linked tariff. Present: success grants an entitlement. Absent:
    /// success credits the account balance. The paths are mutually exclusive.
    pub tariff_id: Option<Uuid>,

    pub status: String,

    /// Open key/value bag holding per-workflow progress markers
    /// (`<ns>AppliedAt`, `<ns>InProgressAt`, `<ns>Attempts`, ...).
    pub metadata: Json,

    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn status(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.status)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
