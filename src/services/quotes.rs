use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::SimpleExpr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::estimates::{Estimate, EstimateCalculator, EstimateInput};
use super::meetings::{calendar_invite, insert_meeting, meetings_for_quote, ScheduleMeetingRequest};
use super::notifications::{insert_notification, NewNotification};
use super::quote_numbers::{format_quote_number, next_sequence, MAX_NUMBER_ATTEMPTS};
use super::{page_window, Outcome, SideEffectKind, SideEffectReport, SortOrder};
use crate::auth::Actor;
use crate::config::AppConfig;
use crate::db::{is_unique_violation, DbPool};
use crate::entities::meeting::{self, Attendee};
use crate::entities::notification::NotificationKind;
use crate::entities::quote::{
    self, ClientInfo, Column, Entity as QuoteEntity, MeetingIds, ProjectDetails, QuoteItem,
    QuoteItems, QuoteStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::mailer::{EmailAttachment, EmailMessage, Mailer};
use crate::integrations::pdf::QuoteRenderer;

type ServiceResult<T> = Result<T, ServiceError>;

fn rule(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Borrowed(message));
    err
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn validate_client(client: &ClientInfo) -> Result<(), ValidationError> {
    if is_blank(&client.name) {
        return Err(rule("client_name", "client.name is required"));
    }
    if is_blank(&client.email) {
        return Err(rule("client_email", "client.email is required"));
    }
    if !validator::validate_email(client.email.trim()) {
        return Err(rule("client_email", "client.email is not a valid email address"));
    }
    Ok(())
}

fn validate_project(project: &ProjectDetails) -> Result<(), ValidationError> {
    if is_blank(&project.title) {
        return Err(rule("project_title", "project.title is required"));
    }
    if is_blank(&project.description) {
        return Err(rule("project_description", "project.description is required"));
    }
    Ok(())
}

fn validate_items(items: &Vec<QuoteItem>) -> Result<(), ValidationError> {
    for item in items {
        if is_blank(&item.name) {
            return Err(rule("item_name", "every item needs a name"));
        }
        if item.quantity <= Decimal::ZERO {
            return Err(rule("item_quantity", "item quantity must be positive"));
        }
        if item.unit_price.is_sign_negative() {
            return Err(rule("item_price", "item unit_price cannot be negative"));
        }
    }
    Ok(())
}

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        return Err(rule("tax_rate", "tax_rate must be a fraction between 0 and 1"));
    }
    Ok(())
}

fn validate_non_negative(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() {
        return Err(rule("negative_amount", "amount cannot be negative"));
    }
    Ok(())
}

/// Body of `POST /quotes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateQuoteRequest {
    #[validate(custom = "validate_client")]
    pub client: ClientInfo,
    #[validate(custom = "validate_project")]
    pub project: ProjectDetails,
    #[serde(default)]
    #[validate(custom = "validate_items")]
    pub items: Vec<QuoteItem>,
    /// Fraction, e.g. `0.08`; the configured default when absent
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_non_negative")]
    pub discount: Option<Decimal>,
    #[serde(default)]
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub terms: Option<String>,
    #[serde(default)]
    pub issue_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub estimate_min: Option<Decimal>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub estimate_max: Option<Decimal>,
}

/// Body of `PUT /quotes/:id`; absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateQuoteRequest {
    #[validate(custom = "validate_client")]
    pub client: Option<ClientInfo>,
    #[validate(custom = "validate_project")]
    pub project: Option<ProjectDetails>,
    #[validate(custom = "validate_items")]
    pub items: Option<Vec<QuoteItem>>,
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_non_negative")]
    pub discount: Option<Decimal>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Body of `POST /quotes/from-estimate`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct QuoteFromEstimateRequest {
    #[validate(custom = "validate_client")]
    pub client: ClientInfo,
    #[validate]
    pub estimate: EstimateInput,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_non_negative")]
    pub discount: Option<Decimal>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub terms: Option<String>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSortField {
    #[default]
    CreatedAt,
    IssueDate,
    Total,
    ValidUntil,
}

impl QuoteSortField {
    fn column(self) -> Column {
        match self {
            Self::CreatedAt => Column::CreatedAt,
            Self::IssueDate => Column::IssueDate,
            Self::Total => Column::Total,
            Self::ValidUntil => Column::ValidUntil,
        }
    }
}

/// Query of `GET /quotes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct QuoteListFilter {
    pub status: Option<QuoteStatus>,
    pub issued_from: Option<DateTime<Utc>>,
    pub issued_to: Option<DateTime<Utc>>,
    #[param(value_type = Option<String>)]
    #[schema(value_type = Option<String>)]
    pub min_total: Option<Decimal>,
    #[param(value_type = Option<String>)]
    #[schema(value_type = Option<String>)]
    pub max_total: Option<Decimal>,
    #[serde(default)]
    pub sort_by: QuoteSortField,
    #[serde(default)]
    pub sort_order: SortOrder,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

/// A page of quotes with the total match count.
#[derive(Debug, Clone)]
pub struct QuotePage {
    pub quotes: Vec<quote::Model>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduledMeeting {
    #[schema(value_type = Object)]
    pub quote: quote::Model,
    #[schema(value_type = Object)]
    pub meeting: meeting::Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// `subtotal = Σ qty × price`, `tax = subtotal × rate`,
/// `total = subtotal + tax − discount` floored at zero; all to cents.
/// Amounts too large for a `Decimal` are a validation error.
pub fn compute_totals(
    items: &[QuoteItem],
    tax_rate: Decimal,
    discount: Decimal,
) -> ServiceResult<Totals> {
    let too_large = || ServiceError::ValidationError("quote amounts are too large".to_string());
    let subtotal = items
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| {
            item.quantity
                .checked_mul(item.unit_price)
                .and_then(|line| sum.checked_add(line))
        })
        .ok_or_else(too_large)?
        .round_dp(2);
    let tax = subtotal.checked_mul(tax_rate).ok_or_else(too_large)?.round_dp(2);
    let total = subtotal
        .checked_add(tax)
        .and_then(|gross| gross.checked_sub(discount))
        .ok_or_else(too_large)?
        .max(Decimal::ZERO)
        .round_dp(2);
    Ok(Totals {
        subtotal,
        tax,
        total,
    })
}

/// Quote defaults read from configuration.
#[derive(Debug, Clone)]
pub struct QuoteSettings {
    pub validity_days: i64,
    pub default_tax_rate: Decimal,
    pub default_currency: String,
    pub public_base_url: String,
    pub organizer_email: String,
}

impl From<&AppConfig> for QuoteSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            validity_days: cfg.quote_validity_days,
            default_tax_rate: cfg.default_tax_rate(),
            default_currency: cfg.default_currency.clone(),
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
            organizer_email: cfg.email_from.clone(),
        }
    }
}

/// Quote lifecycle: creation, edits, client responses, meetings and expiry.
#[derive(Clone)]
pub struct QuoteService {
    db: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    calculator: Arc<EstimateCalculator>,
    renderer: Arc<dyn QuoteRenderer>,
    mailer: Arc<dyn Mailer>,
    settings: QuoteSettings,
}

impl QuoteService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        calculator: Arc<EstimateCalculator>,
        renderer: Arc<dyn QuoteRenderer>,
        mailer: Arc<dyn Mailer>,
        settings: QuoteSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            calculator,
            renderer,
            mailer,
            settings,
        }
    }

    pub fn settings(&self) -> &QuoteSettings {
        &self.settings
    }

    /// Creates a draft quote with computed totals and a fresh quote number,
    /// then renders its PDF.
    #[instrument(skip(self, request), fields(user_id = %actor.user_id))]
    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateQuoteRequest,
    ) -> ServiceResult<Outcome<quote::Model>> {
        request.validate()?;

        let now = Utc::now();
        let issue_date = request.issue_date.unwrap_or(now);
        let valid_until = request
            .valid_until
            .unwrap_or_else(|| issue_date + Duration::days(self.settings.validity_days));
        if valid_until < issue_date {
            return Err(ServiceError::ValidationError(
                "valid_until cannot be before issue_date".to_string(),
            ));
        }

        let tax_rate = request.tax_rate.unwrap_or(self.settings.default_tax_rate);
        let discount = request.discount.unwrap_or(Decimal::ZERO);
        let totals = compute_totals(&request.items, tax_rate, discount)?;
        let currency = request
            .currency
            .unwrap_or_else(|| self.settings.default_currency.clone())
            .to_uppercase();

        let template = quote::ActiveModel {
            user_id: Set(actor.user_id),
            owner_email: Set(actor.email.clone()),
            client: Set(request.client),
            project: Set(request.project),
            items: Set(QuoteItems(request.items)),
            subtotal: Set(totals.subtotal),
            tax_rate: Set(tax_rate),
            tax: Set(totals.tax),
            discount: Set(discount),
            total: Set(totals.total),
            currency: Set(currency),
            estimate_min: Set(request.estimate_min),
            estimate_max: Set(request.estimate_max),
            notes: Set(request.notes),
            terms: Set(request.terms),
            pdf_url: Set(None),
            meeting_ids: Set(MeetingIds::default()),
            status: Set(QuoteStatus::Draft),
            issue_date: Set(issue_date),
            valid_until: Set(valid_until),
            sent_at: Set(None),
            viewed_at: Set(None),
            accepted_at: Set(None),
            declined_at: Set(None),
            decline_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let saved = self.insert_numbered(template, now).await?;
        info!(quote_id = %saved.id, quote_number = %saved.quote_number, "Quote created");
        counter!("quotes.created", 1);
        self.event_sender.publish(Event::QuoteCreated {
            quote_id: saved.id,
            quote_number: saved.quote_number.clone(),
        });

        let mut outcome = Outcome::new(saved);
        self.render_pdf(&mut outcome).await;
        Ok(outcome)
    }

    /// Inserts with the month's next number, moving on to the following
    /// number when a concurrent insert took it.
    async fn insert_numbered(
        &self,
        template: quote::ActiveModel,
        now: DateTime<Utc>,
    ) -> ServiceResult<quote::Model> {
        let first = next_sequence(&*self.db, now).await?;

        for attempt in 0..MAX_NUMBER_ATTEMPTS {
            let number = format_quote_number(now, first + attempt);
            let mut model = template.clone();
            model.id = Set(Uuid::new_v4());
            model.quote_number = Set(number.clone());

            match model.insert(&*self.db).await {
                Ok(saved) => return Ok(saved),
                Err(e) if is_unique_violation(&e) => {
                    warn!(%number, attempt, "Quote number taken, trying the next one");
                    counter!("quotes.number_collisions", 1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Conflict(
            "could not allocate a quote number, retry the request".to_string(),
        ))
    }

    #[instrument(skip(self), fields(user_id = %actor.user_id))]
    pub async fn get(&self, actor: &Actor, id: Uuid) -> ServiceResult<quote::Model> {
        let found = self.find(&*self.db, id).await?;
        actor.ensure_can_access(found.user_id, "quote")?;
        Ok(found)
    }

    /// Owner-scoped listing; admins see every quote.
    #[instrument(skip(self, filter), fields(user_id = %actor.user_id))]
    pub async fn list(&self, actor: &Actor, filter: QuoteListFilter) -> ServiceResult<QuotePage> {
        let mut query = QuoteEntity::find();
        if !actor.is_admin {
            query = query.filter(Column::UserId.eq(actor.user_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(from) = filter.issued_from {
            query = query.filter(Column::IssueDate.gte(from));
        }
        if let Some(to) = filter.issued_to {
            query = query.filter(Column::IssueDate.lte(to));
        }
        if let Some(min) = filter.min_total {
            query = query.filter(Column::Total.gte(min));
        }
        if let Some(max) = filter.max_total {
            query = query.filter(Column::Total.lte(max));
        }
        query = query
            .order_by(filter.sort_by.column(), filter.sort_order.into())
            .order_by_asc(Column::Id);

        let (page, per_page) = page_window(filter.page, filter.per_page);
        let paginator = query.paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let quotes = paginator.fetch_page(page - 1).await?;

        Ok(QuotePage {
            quotes,
            page,
            per_page,
            total,
        })
    }

    /// Edits a quote that is still open, recomputing totals and the PDF.
    #[instrument(skip(self, patch), fields(user_id = %actor.user_id))]
    pub async fn update(
        &self,
        actor: &Actor,
        id: Uuid,
        patch: UpdateQuoteRequest,
    ) -> ServiceResult<Outcome<quote::Model>> {
        patch.validate()?;
        let current = self.find(&*self.db, id).await?;
        actor.ensure_can_access(current.user_id, "quote")?;
        if current.status.is_closed() {
            return Err(ServiceError::invalid_state("update", current.status));
        }

        let valid_until = patch.valid_until.unwrap_or(current.valid_until);
        if valid_until < current.issue_date {
            return Err(ServiceError::ValidationError(
                "valid_until cannot be before issue_date".to_string(),
            ));
        }
        let items = patch.items.unwrap_or(current.items.0);
        let tax_rate = patch.tax_rate.unwrap_or(current.tax_rate);
        let discount = patch.discount.unwrap_or(current.discount);
        let totals = compute_totals(&items, tax_rate, discount)?;

        let changes = quote::ActiveModel {
            client: Set(patch.client.unwrap_or(current.client)),
            project: Set(patch.project.unwrap_or(current.project)),
            items: Set(QuoteItems(items)),
            subtotal: Set(totals.subtotal),
            tax_rate: Set(tax_rate),
            tax: Set(totals.tax),
            discount: Set(discount),
            total: Set(totals.total),
            currency: Set(patch
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or(current.currency)),
            notes: Set(patch.notes.or(current.notes)),
            terms: Set(patch.terms.or(current.terms)),
            valid_until: Set(valid_until),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };

        let open = [QuoteStatus::Draft, QuoteStatus::Sent, QuoteStatus::Viewed];
        if !apply_transition(&*self.db, id, &open, changes, None).await? {
            return Err(self.rejection(id, "update").await);
        }
        let updated = self.find(&*self.db, id).await?;
        self.event_sender.publish(Event::QuoteUpdated(id));

        let mut outcome = Outcome::new(updated);
        self.render_pdf(&mut outcome).await;
        Ok(outcome)
    }

    /// `draft → sent`, then emails the client with the PDF attached.
    #[instrument(skip(self), fields(user_id = %actor.user_id))]
    pub async fn send(&self, actor: &Actor, id: Uuid) -> ServiceResult<Outcome<quote::Model>> {
        let current = self.find(&*self.db, id).await?;
        actor.ensure_can_access(current.user_id, "quote")?;
        if current.status != QuoteStatus::Draft {
            return Err(ServiceError::invalid_state("send", current.status));
        }

        let now = Utc::now();
        let changes = quote::ActiveModel {
            status: Set(QuoteStatus::Sent),
            sent_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        if !apply_transition(&*self.db, id, &[QuoteStatus::Draft], changes, None).await? {
            return Err(self.rejection(id, "send").await);
        }
        let sent = self.find(&*self.db, id).await?;
        self.status_changed(&sent, QuoteStatus::Draft);

        let mut outcome = Outcome::new(sent);
        let pdf = self.render_pdf(&mut outcome).await;
        let message = self.client_quote_email(&outcome.value, pdf);
        let result = self.mailer.send(&message).await;
        outcome.record(SideEffectKind::Email, result);
        Ok(outcome)
    }

    /// `sent → viewed` when the client opens the quote; tells the owner.
    #[instrument(skip(self))]
    pub async fn mark_viewed(&self, id: Uuid) -> ServiceResult<Outcome<quote::Model>> {
        let current = self.find(&*self.db, id).await?;
        if current.status != QuoteStatus::Sent {
            return Err(ServiceError::invalid_state("mark as viewed", current.status));
        }

        let now = Utc::now();
        let changes = quote::ActiveModel {
            status: Set(QuoteStatus::Viewed),
            viewed_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        if !apply_transition(&*self.db, id, &[QuoteStatus::Sent], changes, None).await? {
            return Err(self.rejection(id, "mark as viewed").await);
        }
        let viewed = self.find(&*self.db, id).await?;
        self.status_changed(&viewed, QuoteStatus::Sent);

        let notice = NewNotification {
            user_id: viewed.user_id,
            kind: NotificationKind::QuoteViewed,
            title: format!("Quote {} viewed", viewed.quote_number),
            message: format!("{} opened quote {}.", viewed.client.name, viewed.quote_number),
            reference_id: Some(viewed.id),
        };
        let mut outcome = Outcome::new(viewed);
        let result = insert_notification(&*self.db, notice).await.map(|_| ());
        outcome.record(SideEffectKind::Notification, result);
        Ok(outcome)
    }

    /// Client accepts a sent or viewed quote before `valid_until`.
    #[instrument(skip(self))]
    pub async fn accept(&self, id: Uuid) -> ServiceResult<Outcome<quote::Model>> {
        let now = Utc::now();
        let current = self.find(&*self.db, id).await?;
        if !current.status.awaiting_client() {
            return Err(ServiceError::invalid_state("accept", current.status));
        }
        if now > current.valid_until {
            return Err(expired(&current));
        }

        let changes = quote::ActiveModel {
            status: Set(QuoteStatus::Accepted),
            accepted_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        let txn = self.db.begin().await?;
        let still_valid = Column::ValidUntil.gte(now);
        if !apply_transition(&txn, id, &AWAITING_CLIENT, changes, Some(still_valid)).await? {
            txn.rollback().await?;
            let stored = self.find(&*self.db, id).await?;
            if stored.status.awaiting_client() && now > stored.valid_until {
                return Err(expired(&stored));
            }
            return Err(ServiceError::invalid_state("accept", stored.status));
        }
        let accepted = self.find(&txn, id).await?;
        insert_notification(
            &txn,
            NewNotification {
                user_id: accepted.user_id,
                kind: NotificationKind::QuoteAccepted,
                title: format!("Quote {} accepted", accepted.quote_number),
                message: format!(
                    "{} accepted quote {} ({} {}).",
                    accepted.client.name, accepted.quote_number, accepted.total, accepted.currency
                ),
                reference_id: Some(accepted.id),
            },
        )
        .await?;
        txn.commit().await?;
        self.status_changed(&accepted, current.status);

        let mut outcome = Outcome::new(accepted);
        outcome.push(SideEffectReport::delivered(SideEffectKind::Notification));
        let subject = format!("Quote {} was accepted", outcome.value.quote_number);
        let body = format!(
            "<p>{} accepted quote <strong>{}</strong> for {} {}.</p>",
            outcome.value.client.name,
            outcome.value.quote_number,
            outcome.value.total,
            outcome.value.currency
        );
        self.email_owner(&mut outcome, subject, body).await;
        Ok(outcome)
    }

    /// Client declines a sent or viewed quote.
    #[instrument(skip(self, reason))]
    pub async fn decline(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> ServiceResult<Outcome<quote::Model>> {
        let current = self.find(&*self.db, id).await?;
        if !current.status.awaiting_client() {
            return Err(ServiceError::invalid_state("decline", current.status));
        }

        let now = Utc::now();
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let changes = quote::ActiveModel {
            status: Set(QuoteStatus::Declined),
            declined_at: Set(Some(now)),
            decline_reason: Set(reason.clone()),
            updated_at: Set(now),
            ..Default::default()
        };
        let txn = self.db.begin().await?;
        if !apply_transition(&txn, id, &AWAITING_CLIENT, changes, None).await? {
            txn.rollback().await?;
            return Err(self.rejection(id, "decline").await);
        }
        let declined = self.find(&txn, id).await?;
        insert_notification(
            &txn,
            NewNotification {
                user_id: declined.user_id,
                kind: NotificationKind::QuoteDeclined,
                title: format!("Quote {} declined", declined.quote_number),
                message: match &reason {
                    Some(r) => format!("{} declined: {}", declined.client.name, r),
                    None => format!("{} declined the quote.", declined.client.name),
                },
                reference_id: Some(declined.id),
            },
        )
        .await?;
        txn.commit().await?;
        self.status_changed(&declined, current.status);

        let mut outcome = Outcome::new(declined);
        outcome.push(SideEffectReport::delivered(SideEffectKind::Notification));
        let subject = format!("Quote {} was declined", outcome.value.quote_number);
        let body = format!(
            "<p>{} declined quote <strong>{}</strong>.</p><p>Reason: {}</p>",
            outcome.value.client.name,
            outcome.value.quote_number,
            reason.as_deref().unwrap_or("none given")
        );
        self.email_owner(&mut outcome, subject, body).await;
        Ok(outcome)
    }

    /// Books a meeting with the client and mails them a calendar invite.
    /// The quote's status is left alone.
    #[instrument(skip(self, request), fields(user_id = %actor.user_id))]
    pub async fn schedule_meeting(
        &self,
        actor: &Actor,
        id: Uuid,
        request: ScheduleMeetingRequest,
    ) -> ServiceResult<Outcome<ScheduledMeeting>> {
        request.validate()?;
        let current = self.find(&*self.db, id).await?;
        actor.ensure_can_access(current.user_id, "quote")?;
        if current.status == QuoteStatus::Archived {
            return Err(ServiceError::invalid_state(
                "schedule a meeting",
                current.status,
            ));
        }

        let client = Attendee {
            name: current.client.name.clone(),
            email: current.client.email.clone(),
        };
        let default_title = format!("Quote {} review", current.quote_number);

        let txn = self.db.begin().await?;
        let meeting = insert_meeting(&txn, id, actor.user_id, default_title, client, request).await?;
        let meeting_ids: Vec<Uuid> = meetings_for_quote(&txn, id)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        let changes = quote::ActiveModel {
            meeting_ids: Set(MeetingIds(meeting_ids)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let not_archived = [
            QuoteStatus::Draft,
            QuoteStatus::Sent,
            QuoteStatus::Viewed,
            QuoteStatus::Accepted,
            QuoteStatus::Declined,
            QuoteStatus::Expired,
        ];
        if !apply_transition(&txn, id, &not_archived, changes, None).await? {
            txn.rollback().await?;
            return Err(self.rejection(id, "schedule a meeting").await);
        }
        let updated = self.find(&txn, id).await?;
        txn.commit().await?;

        info!(quote_id = %id, meeting_id = %meeting.id, starts_at = %meeting.starts_at, "Meeting scheduled");
        self.event_sender.publish(Event::MeetingScheduled {
            quote_id: id,
            meeting_id: meeting.id,
        });

        let notice = NewNotification {
            user_id: updated.user_id,
            kind: NotificationKind::MeetingScheduled,
            title: format!("Meeting scheduled for {}", updated.quote_number),
            message: format!(
                "{} on {}",
                meeting.title,
                meeting.starts_at.format("%Y-%m-%d %H:%M UTC")
            ),
            reference_id: Some(meeting.id),
        };

        let ics = calendar_invite(&meeting, &self.settings.organizer_email);
        let message = EmailMessage::new(
            updated.client.email.clone(),
            format!("Invitation: {}", meeting.title),
            format!(
                "<p>Hi {},</p><p>You are invited to <strong>{}</strong> on {} ({} minutes).</p>{}",
                updated.client.name,
                meeting.title,
                meeting.starts_at.format("%A %e %B %Y, %H:%M UTC"),
                meeting.duration_minutes,
                meeting
                    .meeting_url
                    .as_deref()
                    .map(|url| format!("<p>Join: <a href=\"{0}\">{0}</a></p>", url))
                    .unwrap_or_default()
            ),
        )
        .attach(EmailAttachment {
            filename: "invite.ics".to_string(),
            content_type: "text/calendar; method=REQUEST; charset=UTF-8".to_string(),
            content: ics.into_bytes(),
        });

        let mut outcome = Outcome::new(ScheduledMeeting {
            quote: updated,
            meeting,
        });
        let invite = self.mailer.send(&message).await;
        outcome.record(SideEffectKind::CalendarInvite, invite);
        let stored = insert_notification(&*self.db, notice).await.map(|_| ());
        outcome.record(SideEffectKind::Notification, stored);
        Ok(outcome)
    }

    /// Housekeeping: any status other than `archived` moves to `archived`.
    #[instrument(skip(self), fields(user_id = %actor.user_id))]
    pub async fn archive(&self, actor: &Actor, id: Uuid) -> ServiceResult<quote::Model> {
        let current = self.find(&*self.db, id).await?;
        actor.ensure_can_access(current.user_id, "quote")?;
        if current.status == QuoteStatus::Archived {
            return Err(ServiceError::invalid_state("archive", current.status));
        }

        let changes = quote::ActiveModel {
            status: Set(QuoteStatus::Archived),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let archivable = [current.status];
        if !apply_transition(&*self.db, id, &archivable, changes, None).await? {
            return Err(self.rejection(id, "archive").await);
        }
        let archived = self.find(&*self.db, id).await?;
        self.status_changed(&archived, current.status);
        Ok(archived)
    }

    /// Expires every sent or viewed quote whose `valid_until` has passed.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> ServiceResult<u64> {
        let changes = quote::ActiveModel {
            status: Set(QuoteStatus::Expired),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = QuoteEntity::update_many()
            .set(changes)
            .filter(Column::Status.is_in(AWAITING_CLIENT))
            .filter(Column::ValidUntil.lt(now))
            .exec(&*self.db)
            .await?;

        let count = result.rows_affected;
        if count > 0 {
            info!(count, "Expired overdue quotes");
            self.event_sender.publish(Event::QuotesExpired { count });
        }
        Ok(count)
    }

    pub async fn estimate(&self, input: &EstimateInput) -> ServiceResult<Estimate> {
        self.calculator.estimate(input).await
    }

    /// Prices the selections, then creates a quote carrying one line per
    /// base, feature and technology plus the estimated range.
    #[instrument(skip(self, request), fields(user_id = %actor.user_id))]
    pub async fn create_from_estimate(
        &self,
        actor: &Actor,
        request: QuoteFromEstimateRequest,
    ) -> ServiceResult<Outcome<quote::Model>> {
        request.validate()?;
        let estimate = self.calculator.estimate(&request.estimate).await?;
        let create = quote_request_from_estimate(request, estimate);
        self.create(actor, create).await
    }

    async fn find<C: ConnectionTrait>(&self, conn: &C, id: Uuid) -> ServiceResult<quote::Model> {
        QuoteEntity::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Quote {} not found", id)))
    }

    /// Why a conditional update changed nothing: the row is gone or its
    /// status moved under us.
    async fn rejection(&self, id: Uuid, action: &str) -> ServiceError {
        match self.find(&*self.db, id).await {
            Ok(stored) => ServiceError::invalid_state(action, stored.status),
            Err(e) => e,
        }
    }

    fn status_changed(&self, quote: &quote::Model, from: QuoteStatus) {
        info!(quote_id = %quote.id, %from, to = %quote.status, "Quote status changed");
        self.event_sender.publish(Event::QuoteStatusChanged {
            quote_id: quote.id,
            from,
            to: quote.status,
        });
    }

    /// Renders the PDF and stores its URL on the quote. Returns the bytes on success.
    async fn render_pdf(&self, outcome: &mut Outcome<quote::Model>) -> Option<Vec<u8>> {
        let pdf = match self.renderer.render(&outcome.value).await {
            Ok(pdf) => pdf,
            Err(e) => {
                outcome.push(SideEffectReport::failed(SideEffectKind::Pdf, e.to_string()));
                return None;
            }
        };

        if outcome.value.pdf_url.as_deref() != Some(pdf.url.as_str()) {
            let changes = quote::ActiveModel {
                pdf_url: Set(Some(pdf.url.clone())),
                ..Default::default()
            };
            let stored = QuoteEntity::update_many()
                .set(changes)
                .filter(Column::Id.eq(outcome.value.id))
                .exec(&*self.db)
                .await;
            if let Err(e) = stored {
                outcome.push(SideEffectReport::failed(SideEffectKind::Pdf, e.to_string()));
                return Some(pdf.bytes);
            }
            outcome.value.pdf_url = Some(pdf.url);
        }
        outcome.push(SideEffectReport::delivered(SideEffectKind::Pdf));
        Some(pdf.bytes)
    }

    fn client_quote_email(&self, quote: &quote::Model, pdf: Option<Vec<u8>>) -> EmailMessage {
        let link = format!("{}/quotes/{}", self.settings.public_base_url, quote.id);
        let message = EmailMessage::new(
            quote.client.email.clone(),
            format!("Your quote {} from VAIF TECH", quote.quote_number),
            format!(
                "<p>Hi {},</p><p>Your quote for <strong>{}</strong> is ready: {} {}.</p>\
                 <p>It is valid until {}.</p><p><a href=\"{}\">View and respond</a></p>",
                quote.client.name,
                quote.project.title,
                quote.total,
                quote.currency,
                quote.valid_until.format("%B %e, %Y"),
                link
            ),
        )
        .with_text(format!(
            "Your quote {} is ready. View it at {}",
            quote.quote_number, link
        ));

        match pdf {
            Some(bytes) => message.attach(EmailAttachment {
                filename: format!("{}.pdf", quote.quote_number),
                content_type: "application/pdf".to_string(),
                content: bytes,
            }),
            None => message,
        }
    }

    async fn email_owner(&self, outcome: &mut Outcome<quote::Model>, subject: String, html: String) {
        match outcome.value.owner_email.clone() {
            Some(to) => {
                let result = self.mailer.send(&EmailMessage::new(to, subject, html)).await;
                outcome.record(SideEffectKind::Email, result);
            }
            None => outcome.push(SideEffectReport::skipped(
                SideEffectKind::Email,
                "owner has no email address on file",
            )),
        }
    }
}

const AWAITING_CLIENT: [QuoteStatus; 2] = [QuoteStatus::Sent, QuoteStatus::Viewed];

fn expired(quote: &quote::Model) -> ServiceError {
    ServiceError::Expired(format!(
        "quote {} expired on {}",
        quote.quote_number,
        quote.valid_until.to_rfc3339()
    ))
}

/// `UPDATE quotes SET … WHERE id = ? AND status IN (…) [AND guard]`.
/// True when the row changed.
async fn apply_transition<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    from: &[QuoteStatus],
    changes: quote::ActiveModel,
    guard: Option<SimpleExpr>,
) -> ServiceResult<bool> {
    let mut update = QuoteEntity::update_many()
        .set(changes)
        .filter(Column::Id.eq(id))
        .filter(Column::Status.is_in(from.iter().copied()));
    if let Some(guard) = guard {
        update = update.filter(guard);
    }
    let result = update.exec(conn).await?;
    Ok(result.rows_affected == 1)
}

fn quote_request_from_estimate(
    request: QuoteFromEstimateRequest,
    estimate: Estimate,
) -> CreateQuoteRequest {
    let project_name = estimate.project_type.name.clone();
    let title = request
        .title
        .filter(|t| !is_blank(t))
        .unwrap_or_else(|| {
            let who = request
                .client
                .company
                .clone()
                .unwrap_or_else(|| request.client.name.clone());
            format!("{} for {}", project_name, who)
        });
    let description = request
        .description
        .or_else(|| request.estimate.description.clone())
        .filter(|d| !is_blank(d))
        .unwrap_or_else(|| {
            format!(
                "{} with {} features and {} technologies",
                project_name,
                estimate.breakdown.features.len(),
                estimate.breakdown.technologies.len()
            )
        });

    let extras: Vec<QuoteItem> = estimate
        .breakdown
        .features
        .iter()
        .map(|f| (f, "Feature"))
        .chain(
            estimate
                .breakdown
                .technologies
                .iter()
                .filter(|t| !t.price.is_sign_negative())
                .map(|t| (t, "Technology")),
        )
        .map(|(option, kind)| QuoteItem {
            name: option.name.clone(),
            description: Some(kind.to_string()),
            quantity: Decimal::ONE,
            unit_price: option.price,
        })
        .collect();
    let savings: Vec<&str> = estimate
        .breakdown
        .technologies
        .iter()
        .filter(|t| t.price.is_sign_negative())
        .map(|t| t.name.as_str())
        .collect();

    // Lines sum to the estimate; price-reducing technologies lower the base line
    let extras_total: Decimal = extras.iter().map(|i| i.unit_price).sum();
    let base_line = estimate.base_estimate - extras_total;
    let mut base_description =
        "Base build adjusted for category, industry and timeline".to_string();
    if !savings.is_empty() {
        base_description.push_str(&format!(", less savings from {}", savings.join(", ")));
    }
    let items = if base_line < Decimal::ZERO {
        vec![QuoteItem {
            name: format!("{} (all inclusive)", project_name),
            description: Some(base_description),
            quantity: Decimal::ONE,
            unit_price: estimate.base_estimate,
        }]
    } else {
        let mut items = vec![QuoteItem {
            name: format!("{} (base)", project_name),
            description: Some(base_description),
            quantity: Decimal::ONE,
            unit_price: base_line,
        }];
        items.extend(extras);
        items
    };

    let project = ProjectDetails {
        title,
        description,
        project_type: Some(estimate.project_type.code.clone()),
        project_type_name: Some(project_name),
        category: estimate.category.as_ref().map(|c| c.code.clone()),
        category_name: estimate.category.as_ref().map(|c| c.name.clone()),
        industry: estimate.industry.as_ref().map(|c| c.code.clone()),
        industry_name: estimate.industry.as_ref().map(|c| c.name.clone()),
        timeline: estimate.timeline.as_ref().map(|c| c.code.clone()),
        timeline_name: estimate.timeline.as_ref().map(|c| c.name.clone()),
        complexity: Some(estimate.complexity),
        features: estimate.breakdown.features,
        technologies: estimate.breakdown.technologies,
        ai_analysis: estimate.analysis,
    };

    CreateQuoteRequest {
        client: request.client,
        project,
        items,
        tax_rate: request.tax_rate,
        discount: request.discount,
        currency: Some(estimate.currency),
        notes: request.notes,
        terms: request.terms,
        issue_date: None,
        valid_until: request.valid_until,
        estimate_min: Some(estimate.min_estimate),
        estimate_max: Some(estimate.max_estimate),
    }
}
