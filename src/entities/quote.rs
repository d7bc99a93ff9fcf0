use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a quote.
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
pub enum QuoteStatus {
    #[sea_orm(string_value = "draft")]
    Draft,
    #[sea_orm(string_value = "sent")]
    Sent,
    #[sea_orm(string_value = "viewed")]
    Viewed,
    #[sea_orm(string_value = "accepted")]
    Accepted,
    #[sea_orm(string_value = "declined")]
    Declined,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "archived")]
    Archived,
}

impl QuoteStatus {
    /// Statuses that reject edits, re-send, view and client responses
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Declined | Self::Expired | Self::Archived
        )
    }

    /// Statuses in which the client may still view, accept or decline
    pub fn awaiting_client(self) -> bool {
        matches!(self, Self::Sent | Self::Viewed)
    }

    pub fn can_transition_to(self, next: QuoteStatus) -> bool {
        use QuoteStatus::*;
        match (self, next) {
            (Draft, Sent) => true,
            (Sent, Viewed) => true,
            (Sent | Viewed, Accepted | Declined | Expired) => true,
            (from, Archived) => from != Archived,
            _ => false,
        }
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
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProjectComplexity {
    #[sea_orm(string_value = "simple")]
    Simple,
    #[sea_orm(string_value = "moderate")]
    Moderate,
    #[sea_orm(string_value = "complex")]
    Complex,
    #[sea_orm(string_value = "enterprise")]
    Enterprise,
}

impl ProjectComplexity {
    /// Buckets a project by how many features and technologies it selects.
    pub fn from_selection_count(count: usize) -> Self {
        match count {
            0..=3 => Self::Simple,
            4..=6 => Self::Moderate,
            7..=10 => Self::Complex,
            _ => Self::Enterprise,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Address {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Client block captured on the quote
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, ToSchema,
)]
pub struct ClientInfo {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
}

/// A priced feature or technology chosen for the project.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SelectedOption {
    pub code: String,
    pub name: String,
    #[schema(value_type = String)]
    pub price: Decimal,
}

/// Best-effort LLM read of the project description
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProjectAnalysis {
    pub summary: String,
    #[serde(default)]
    pub suggested_features: Vec<String>,
    pub risk_level: String,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, ToSchema,
)]
pub struct ProjectDetails {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub project_type_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub industry_name: Option<String>,
    #[serde(default)]
    pub timeline: Option<String>,
    #[serde(default)]
    pub timeline_name: Option<String>,
    #[serde(default)]
    pub complexity: Option<ProjectComplexity>,
    #[serde(default)]
    pub features: Vec<SelectedOption>,
    #[serde(default)]
    pub technologies: Vec<SelectedOption>,
    #[serde(default)]
    pub ai_analysis: Option<ProjectAnalysis>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuoteItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[schema(value_type = String)]
    pub quantity: Decimal,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
}

impl QuoteItem {
    pub fn line_total(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, ToSchema,
)]
#[serde(transparent)]
pub struct QuoteItems(pub Vec<QuoteItem>);

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, ToSchema,
)]
#[serde(transparent)]
pub struct MeetingIds(pub Vec<Uuid>);

/// The `quotes` table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quotes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// `Q-YY-MM-NNNN`, unique
    #[sea_orm(unique)]
    pub quote_number: String,
    pub user_id: Uuid,
    /// Where accept/decline notices go
    pub owner_email: Option<String>,
    pub client: ClientInfo,
    pub project: ProjectDetails,
    pub items: QuoteItems,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub estimate_min: Option<Decimal>,
    pub estimate_max: Option<Decimal>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub pdf_url: Option<String>,
    pub meeting_ids: MeetingIds,
    pub status: QuoteStatus,
    pub issue_date: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::meeting::Entity")]
    Meetings,
}

impl Related<super::meeting::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Meetings.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case(QuoteStatus::Draft, QuoteStatus::Sent, true)]
    #[case(QuoteStatus::Sent, QuoteStatus::Viewed, true)]
    #[case(QuoteStatus::Viewed, QuoteStatus::Viewed, false)]
    #[case(QuoteStatus::Viewed, QuoteStatus::Accepted, true)]
    #[case(QuoteStatus::Sent, QuoteStatus::Declined, true)]
    #[case(QuoteStatus::Draft, QuoteStatus::Accepted, false)]
    #[case(QuoteStatus::Accepted, QuoteStatus::Sent, false)]
    #[case(QuoteStatus::Expired, QuoteStatus::Accepted, false)]
    #[case(QuoteStatus::Accepted, QuoteStatus::Archived, true)]
    #[case(QuoteStatus::Archived, QuoteStatus::Archived, false)]
    fn quote_transitions(
        #[case] from: QuoteStatus,
        #[case] to: QuoteStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[rstest]
    #[case(0, ProjectComplexity::Simple)]
    #[case(3, ProjectComplexity::Simple)]
    #[case(4, ProjectComplexity::Moderate)]
    #[case(6, ProjectComplexity::Moderate)]
    #[case(10, ProjectComplexity::Complex)]
    #[case(11, ProjectComplexity::Enterprise)]
    fn complexity_buckets(#[case] count: usize, #[case] expected: ProjectComplexity) {
        assert_eq!(ProjectComplexity::from_selection_count(count), expected);
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(QuoteStatus::Viewed.to_string(), "viewed");
        assert_eq!(QuoteStatus::from_str("archived").unwrap(), QuoteStatus::Archived);
        assert_eq!(
            serde_json::to_value(QuoteStatus::Declined).unwrap(),
            serde_json::json!("declined")
        );
    }
}
