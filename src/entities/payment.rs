use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    /// Legal status moves. A failed intent can still succeed when the payer retries it.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Failed) | (Failed, Completed) | (Completed, Refunded)
        )
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "square")]
    Square,
    #[sea_orm(string_value = "bank_transfer")]
    BankTransfer,
    #[sea_orm(string_value = "other")]
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentLineItem {
    /// Product or quote reference the line pays for
    #[serde(default)]
    pub reference: Option<String>,
    pub name: String,
    pub quantity: u32,
    #[schema(value_type = String)]
    pub price: Decimal,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, ToSchema,
)]
#[serde(transparent)]
pub struct PaymentLineItems(pub Vec<PaymentLineItem>);

/// The `payments` table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethod,
    /// Stripe payment intent, unique when present
    #[sea_orm(unique)]
    pub payment_intent_id: Option<String>,
    /// Square payment, unique when present
    #[sea_orm(unique)]
    pub square_payment_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Json>,
    pub line_items: PaymentLineItems,
    pub billing_details: Option<Json>,
    pub receipt_url: Option<String>,
    pub refunded_amount: Option<Decimal>,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(PaymentStatus::Pending, PaymentStatus::Completed => true)]
    #[test_case(PaymentStatus::Pending, PaymentStatus::Failed => true)]
    #[test_case(PaymentStatus::Failed, PaymentStatus::Completed => true)]
    #[test_case(PaymentStatus::Completed, PaymentStatus::Refunded => true)]
    #[test_case(PaymentStatus::Completed, PaymentStatus::Failed => false)]
    #[test_case(PaymentStatus::Refunded, PaymentStatus::Completed => false)]
    #[test_case(PaymentStatus::Pending, PaymentStatus::Refunded => false)]
    #[test_case(PaymentStatus::Completed, PaymentStatus::Completed => false)]
    fn payment_transitions(from: PaymentStatus, to: PaymentStatus) -> bool {
        from.can_transition_to(to)
    }
}
