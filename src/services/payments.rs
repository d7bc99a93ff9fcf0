use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::notifications::{insert_notification, NewNotification};
use super::{page_window, Outcome, SideEffectKind, SideEffectReport, SortOrder};
use crate::auth::Actor;
use crate::db::{is_unique_violation, DbPool};
use crate::entities::notification::NotificationKind;
use crate::entities::payment::{
    self, Column, Entity as PaymentEntity, PaymentLineItem, PaymentLineItems, PaymentMethod,
    PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::mailer::{EmailMessage, Mailer};
use crate::integrations::payments::{ChargeRequest, PaymentProvider, RefundRequest};
use crate::integrations::to_minor_units;

type ServiceResult<T> = Result<T, ServiceError>;

fn validate_positive(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        let mut err = ValidationError::new("amount");
        err.message = Some(Cow::Borrowed("amount must be greater than zero"));
        return Err(err);
    }
    Ok(())
}

fn validate_metadata(metadata: &Value) -> Result<(), ValidationError> {
    if !metadata.is_object() {
        let mut err = ValidationError::new("metadata");
        err.message = Some(Cow::Borrowed("metadata must be a JSON object"));
        return Err(err);
    }
    Ok(())
}

/// Body of `POST /payments`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct InitiatePaymentRequest {
    #[schema(value_type = String)]
    #[validate(custom = "validate_positive")]
    pub amount: Decimal,
    #[serde(default)]
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub description: Option<String>,
    /// Square card nonce; unused for Stripe
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub line_items: Vec<PaymentLineItem>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    #[validate(custom = "validate_metadata")]
    pub metadata: Option<Value>,
    /// Receipt address; the caller's own email when absent
    #[serde(default)]
    #[validate(email)]
    pub billing_email: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: Option<String>,
}

/// Body of `POST /payments/:id/refund`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct RefundPaymentRequest {
    /// Partial amount; the full payment when absent
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    #[validate(custom = "validate_positive")]
    pub amount: Option<Decimal>,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InitiatedPayment {
    #[schema(value_type = Object)]
    pub payment: payment::Model,
    /// Stripe client secret for confirming the intent in the browser
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Query of `GET /payments`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct PaymentListFilter {
    pub status: Option<PaymentStatus>,
    pub method: Option<PaymentMethod>,
    /// Created at or after
    pub from: Option<DateTime<Utc>>,
    /// Created at or before
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sort_order: SortOrder,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PaymentPage {
    pub payments: Vec<payment::Model>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}

/// Receipt address recorded at initiation or reported by the processor.
pub fn billing_email(payment: &payment::Model) -> Option<String> {
    payment
        .billing_details
        .as_ref()
        .and_then(|details| details.get("email"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `UPDATE payments SET … WHERE id = ? AND status = from`. True when the row changed.
pub(crate) async fn apply_payment_transition<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    from: PaymentStatus,
    changes: payment::ActiveModel,
) -> ServiceResult<bool> {
    let result = PaymentEntity::update_many()
        .set(changes)
        .filter(Column::Id.eq(id))
        .filter(Column::Status.eq(from))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

pub(crate) async fn find_payment<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> ServiceResult<payment::Model> {
    PaymentEntity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", id)))
}

/// Owner notification and email for a payment that just entered `completed`
/// or `refunded`. Other statuses announce nothing.
pub(crate) async fn announce_status(
    db: &DbPool,
    mailer: &dyn Mailer,
    payment: &payment::Model,
) -> Vec<SideEffectReport> {
    let (kind, title, subject, html) = match payment.status {
        PaymentStatus::Completed => (
            NotificationKind::PaymentCompleted,
            "Payment received".to_string(),
            "Payment confirmation from VAIF TECH".to_string(),
            format!(
                "<p>We received your payment of {} {}.</p>{}",
                payment.amount,
                payment.currency,
                payment
                    .receipt_url
                    .as_deref()
                    .map(|url| format!("<p><a href=\"{}\">View your receipt</a></p>", url))
                    .unwrap_or_default()
            ),
        ),
        PaymentStatus::Refunded => {
            let refunded = payment.refunded_amount.unwrap_or(payment.amount);
            (
                NotificationKind::PaymentRefunded,
                "Payment refunded".to_string(),
                "Your refund from VAIF TECH".to_string(),
                format!(
                    "<p>We refunded {} {} of your payment.</p><p>Reason: {}</p>",
                    refunded,
                    payment.currency,
                    payment.refund_reason.as_deref().unwrap_or("not given")
                ),
            )
        }
        _ => return Vec::new(),
    };

    let mut reports = Vec::with_capacity(2);
    let notice = NewNotification {
        user_id: payment.user_id,
        kind,
        title,
        message: format!(
            "{} {} payment {} is now {}",
            payment.amount, payment.currency, payment.id, payment.status
        ),
        reference_id: Some(payment.id),
    };
    reports.push(match insert_notification(db, notice).await {
        Ok(_) => SideEffectReport::delivered(SideEffectKind::Notification),
        Err(e) => SideEffectReport::failed(SideEffectKind::Notification, e.to_string()),
    });

    reports.push(match billing_email(payment) {
        Some(to) => match mailer.send(&EmailMessage::new(to, subject, html)).await {
            Ok(()) => SideEffectReport::delivered(SideEffectKind::Email),
            Err(e) => SideEffectReport::failed(SideEffectKind::Email, e.to_string()),
        },
        None => SideEffectReport::skipped(SideEffectKind::Email, "payment has no billing email"),
    });
    reports
}

/// Starting, refunding and reading payments. Webhook-driven changes live in
/// the reconciler.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    mailer: Arc<dyn Mailer>,
    stripe: Arc<dyn PaymentProvider>,
    square: Arc<dyn PaymentProvider>,
    default_currency: String,
}

impl PaymentService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        mailer: Arc<dyn Mailer>,
        stripe: Arc<dyn PaymentProvider>,
        square: Arc<dyn PaymentProvider>,
        default_currency: String,
    ) -> Self {
        Self {
            db,
            event_sender,
            mailer,
            stripe,
            square,
            default_currency,
        }
    }

    fn provider(&self, method: PaymentMethod) -> ServiceResult<&Arc<dyn PaymentProvider>> {
        match method {
            PaymentMethod::Stripe => Ok(&self.stripe),
            PaymentMethod::Square => Ok(&self.square),
            other => Err(ServiceError::ValidationError(format!(
                "{} payments cannot be processed online",
                other
            ))),
        }
    }

    /// Starts a payment with the chosen processor.
    #[instrument(skip(self, request), fields(user_id = %actor.user_id, method = %request.payment_method))]
    pub async fn initiate(
        &self,
        actor: &Actor,
        request: InitiatePaymentRequest,
    ) -> ServiceResult<Outcome<InitiatedPayment>> {
        request.validate()?;
        let provider = self.provider(request.payment_method)?.clone();
        if request.payment_method == PaymentMethod::Square && request.source_id.is_none() {
            return Err(ServiceError::ValidationError(
                "source_id is required for Square payments".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let currency = request
            .currency
            .clone()
            .unwrap_or_else(|| self.default_currency.clone())
            .to_uppercase();
        // Refuse amounts no processor can represent before anything is stored
        to_minor_units(request.amount, &currency)?;
        let receipt_email = request.billing_email.clone().or_else(|| actor.email.clone());

        let mut metadata: BTreeMap<String, String> = BTreeMap::new();
        metadata.insert("payment_id".to_string(), id.to_string());
        metadata.insert("user_id".to_string(), actor.user_id.to_string());
        if let Some(Value::Object(extra)) = &request.metadata {
            for (key, value) in extra {
                let text = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                metadata.entry(key.clone()).or_insert(text);
            }
        }

        let charge = ChargeRequest {
            payment_id: Some(id),
            user_id: actor.user_id,
            amount: request.amount,
            currency: currency.clone(),
            description: request.description.clone(),
            source_id: request.source_id.clone(),
            receipt_email: receipt_email.clone(),
            idempotency_key: request
                .idempotency_key
                .clone()
                .unwrap_or_else(|| id.to_string()),
            metadata,
        };

        let row = payment::ActiveModel {
            id: Set(id),
            user_id: Set(actor.user_id),
            amount: Set(request.amount),
            currency: Set(currency),
            status: Set(PaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            payment_intent_id: Set(None),
            square_payment_id: Set(None),
            description: Set(request.description),
            metadata: Set(request.metadata),
            line_items: Set(PaymentLineItems(request.line_items)),
            billing_details: Set(receipt_email.map(|email| json!({ "email": email }))),
            receipt_url: Set(None),
            refunded_amount: Set(None),
            refund_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let initiated = match request.payment_method {
            PaymentMethod::Square => self.initiate_square(provider.as_ref(), row, &charge).await?,
            _ => self.initiate_stripe(provider.as_ref(), row, &charge).await?,
        };

        let payment = &initiated.value.payment;
        counter!("payments.initiated", 1, "method" => payment.payment_method.to_string());
        self.event_sender.publish(Event::PaymentCreated {
            payment_id: payment.id,
            status: payment.status,
        });
        Ok(initiated)
    }

    /// Pending row first, then the intent; a failed intent fails the row.
    async fn initiate_stripe(
        &self,
        provider: &dyn PaymentProvider,
        row: payment::ActiveModel,
        charge: &ChargeRequest,
    ) -> ServiceResult<Outcome<InitiatedPayment>> {
        let pending = row.insert(&*self.db).await?;

        let result = match provider.charge(charge).await {
            Ok(result) => result,
            Err(e) => {
                warn!(payment_id = %pending.id, error = %e, "Stripe intent creation failed");
                let failed = payment::ActiveModel {
                    status: Set(PaymentStatus::Failed),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                };
                apply_payment_transition(&*self.db, pending.id, PaymentStatus::Pending, failed)
                    .await?;
                counter!("payments.initiation_failed", 1, "method" => "stripe");
                return Err(as_upstream(e));
            }
        };

        let mut changes = payment::ActiveModel {
            payment_intent_id: Set(Some(result.provider_payment_id.clone())),
            receipt_url: Set(result.receipt_url.clone()),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if result.status != PaymentStatus::Pending {
            changes.status = Set(result.status);
        }
        apply_payment_transition(&*self.db, pending.id, PaymentStatus::Pending, changes).await?;
        let stored = find_payment(&*self.db, pending.id).await?;
        info!(payment_id = %stored.id, intent_id = %result.provider_payment_id, "Stripe payment intent created");

        Ok(Outcome::new(InitiatedPayment {
            payment: stored,
            client_secret: result.client_secret,
        }))
    }

    /// Charge first, then record it. The `payment.created` webhook may have
    /// recorded it already, in which case the row is completed from the request.
    /// Whoever inserts a completed row announces it.
    async fn initiate_square(
        &self,
        provider: &dyn PaymentProvider,
        mut row: payment::ActiveModel,
        charge: &ChargeRequest,
    ) -> ServiceResult<Outcome<InitiatedPayment>> {
        let result = provider.charge(charge).await.map_err(|e| {
            counter!("payments.initiation_failed", 1, "method" => "square");
            as_upstream(e)
        })?;
        let square_id = result.provider_payment_id.clone();

        row.status = Set(result.status);
        row.square_payment_id = Set(Some(square_id.clone()));
        row.receipt_url = Set(result.receipt_url.clone());

        let (stored, announce) = match self.find_by_square_id(&square_id).await? {
            Some(existing) => self.merge_square_row(existing, row, result.status).await?,
            None => match row.clone().insert(&*self.db).await {
                Ok(saved) => (saved, true),
                Err(e) if is_unique_violation(&e) => {
                    let existing = self.find_by_square_id(&square_id).await?.ok_or_else(|| {
                        ServiceError::Conflict(format!(
                            "Square payment {} is being recorded concurrently",
                            square_id
                        ))
                    })?;
                    self.merge_square_row(existing, row, result.status).await?
                }
                Err(e) => return Err(e.into()),
            },
        };
        info!(payment_id = %stored.id, square_payment_id = %square_id, status = %stored.status, "Square payment recorded");

        let reports = if announce {
            announce_status(&self.db, self.mailer.as_ref(), &stored).await
        } else {
            Vec::new()
        };
        let mut outcome = Outcome::new(InitiatedPayment {
            payment: stored,
            client_secret: None,
        });
        for report in reports {
            outcome.push(report);
        }
        Ok(outcome)
    }

    async fn find_by_square_id(&self, square_id: &str) -> ServiceResult<Option<payment::Model>> {
        Ok(PaymentEntity::find()
            .filter(Column::SquarePaymentId.eq(square_id))
            .one(&*self.db)
            .await?)
    }

    /// Fills in what only the initiating request knows on a row the webhook
    /// created, then moves it to the status the charge reported. True when
    /// this call changed the status.
    async fn merge_square_row(
        &self,
        existing: payment::Model,
        row: payment::ActiveModel,
        charged: PaymentStatus,
    ) -> ServiceResult<(payment::Model, bool)> {
        let mut active: payment::ActiveModel = existing.clone().into();
        active.description = row.description;
        active.metadata = row.metadata;
        active.line_items = row.line_items;
        if existing.billing_details.is_none() {
            active.billing_details = row.billing_details;
        }
        if existing.receipt_url.is_none() {
            active.receipt_url = row.receipt_url;
        }
        active.updated_at = Set(Utc::now());
        let merged = active.update(&*self.db).await?;

        let from = merged.status;
        if from == charged || !from.can_transition_to(charged) {
            return Ok((merged, false));
        }
        let changes = payment::ActiveModel {
            status: Set(charged),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if !apply_payment_transition(&*self.db, merged.id, from, changes).await? {
            return Ok((find_payment(&*self.db, merged.id).await?, false));
        }
        let stored = find_payment(&*self.db, merged.id).await?;
        info!(payment_id = %stored.id, %from, to = %charged, "Square payment status changed by charge");
        self.event_sender.publish(Event::PaymentStatusChanged {
            payment_id: stored.id,
            from,
            to: charged,
        });
        Ok((stored, true))
    }

    #[instrument(skip(self), fields(user_id = %actor.user_id))]
    pub async fn get(&self, actor: &Actor, id: Uuid) -> ServiceResult<payment::Model> {
        let found = find_payment(&*self.db, id).await?;
        actor.ensure_can_access(found.user_id, "payment")?;
        Ok(found)
    }

    #[instrument(skip(self, filter), fields(user_id = %actor.user_id))]
    pub async fn list(
        &self,
        actor: &Actor,
        filter: PaymentListFilter,
    ) -> ServiceResult<PaymentPage> {
        let mut query = PaymentEntity::find();
        if !actor.is_admin {
            query = query.filter(Column::UserId.eq(actor.user_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(method) = filter.method {
            query = query.filter(Column::PaymentMethod.eq(method));
        }
        if let Some(from) = filter.from {
            query = query.filter(Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(Column::CreatedAt.lte(to));
        }
        query = query
            .order_by(Column::CreatedAt, filter.sort_order.into())
            .order_by_asc(Column::Id);

        let (page, per_page) = page_window(filter.page, filter.per_page);
        let paginator = query.paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let payments = paginator.fetch_page(page - 1).await?;
        Ok(PaymentPage {
            payments,
            page,
            per_page,
            total,
        })
    }

    /// Admin refund of a completed payment through its processor.
    #[instrument(skip(self, request), fields(user_id = %actor.user_id))]
    pub async fn refund(
        &self,
        actor: &Actor,
        id: Uuid,
        request: RefundPaymentRequest,
    ) -> ServiceResult<Outcome<payment::Model>> {
        actor.ensure_admin()?;
        request.validate()?;
        let current = find_payment(&*self.db, id).await?;
        if current.status != PaymentStatus::Completed {
            return Err(ServiceError::invalid_state("refund", current.status));
        }

        let amount = request.amount.unwrap_or(current.amount);
        if amount > current.amount {
            return Err(ServiceError::ValidationError(format!(
                "refund amount {} exceeds the payment amount {}",
                amount, current.amount
            )));
        }
        let provider = self.provider(current.payment_method)?;
        let provider_payment_id = match current.payment_method {
            PaymentMethod::Stripe => current.payment_intent_id.clone(),
            _ => current.square_payment_id.clone(),
        }
        .ok_or_else(|| {
            ServiceError::InvalidState(format!(
                "payment {} has no processor reference to refund",
                id
            ))
        })?;

        let reason = request.reason.filter(|r| !r.trim().is_empty());
        let refunded = provider
            .refund(&RefundRequest {
                provider_payment_id,
                amount: Some(amount),
                currency: current.currency.clone(),
                reason: reason.clone(),
                idempotency_key: format!("refund-{}", id),
            })
            .await
            .map_err(as_upstream)?;
        info!(payment_id = %id, refund_id = %refunded.refund_id, %amount, "Refund issued");

        let changes = payment::ActiveModel {
            status: Set(PaymentStatus::Refunded),
            refunded_amount: Set(Some(refunded.amount.unwrap_or(amount))),
            refund_reason: Set(reason),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let changed =
            apply_payment_transition(&*self.db, id, PaymentStatus::Completed, changes).await?;
        let stored = find_payment(&*self.db, id).await?;
        if !changed {
            if stored.status == PaymentStatus::Refunded {
                // the processor's refund webhook got here first
                return Ok(Outcome::new(stored));
            }
            return Err(ServiceError::invalid_state("refund", stored.status));
        }

        counter!("payments.refunded", 1, "method" => stored.payment_method.to_string());
        self.event_sender.publish(Event::PaymentStatusChanged {
            payment_id: id,
            from: PaymentStatus::Completed,
            to: PaymentStatus::Refunded,
        });
        let reports = announce_status(&self.db, self.mailer.as_ref(), &stored).await;
        let mut outcome = Outcome::new(stored);
        for report in reports {
            outcome.push(report);
        }
        Ok(outcome)
    }
}

fn as_upstream(err: ServiceError) -> ServiceError {
    match err {
        ServiceError::UpstreamError(_) | ServiceError::ValidationError(_) => err,
        other => ServiceError::UpstreamError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::events::channel;
    use crate::integrations::mailer::MockMailer;
    use crate::integrations::payments::{ChargeResult, MockPaymentProvider, RefundResult};
    use crate::services::SideEffectStatus;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    async fn service(
        stripe: MockPaymentProvider,
        square: MockPaymentProvider,
        mailer: MockMailer,
    ) -> (PaymentService, Arc<DbPool>) {
        let db = establish_connection_with_config(&DbConfig::sqlite_memory())
            .await
            .unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);
        let (sender, _events) = channel(64);
        let svc = PaymentService::new(
            db.clone(),
            Arc::new(sender),
            Arc::new(mailer),
            Arc::new(stripe),
            Arc::new(square),
            "USD".to_string(),
        );
        (svc, db)
    }

    fn request(method: PaymentMethod) -> InitiatePaymentRequest {
        InitiatePaymentRequest {
            amount: dec!(250.00),
            currency: None,
            payment_method: method,
            description: Some("Deposit for Q-24-06-0003".into()),
            source_id: Some("cnon:card-nonce-ok".into()),
            line_items: vec![],
            metadata: Some(json!({ "quote_number": "Q-24-06-0003" })),
            billing_email: None,
            idempotency_key: None,
        }
    }

    fn payer() -> Actor {
        Actor::user(Uuid::new_v4()).with_email("payer@example.com")
    }

    async fn recorded_by_webhook(
        db: &DbPool,
        owner: &Actor,
        square_id: &str,
        status: PaymentStatus,
    ) -> payment::Model {
        let now = Utc::now();
        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(owner.user_id),
            amount: Set(dec!(250.00)),
            currency: Set("USD".into()),
            status: Set(status),
            payment_method: Set(PaymentMethod::Square),
            payment_intent_id: Set(None),
            square_payment_id: Set(Some(square_id.to_string())),
            description: Set(None),
            metadata: Set(None),
            line_items: Set(PaymentLineItems::default()),
            billing_details: Set(None),
            receipt_url: Set(None),
            refunded_amount: Set(None),
            refund_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stripe_initiation_records_intent_and_returns_secret() {
        let mut stripe = MockPaymentProvider::new();
        stripe
            .expect_charge()
            .withf(|c| {
                c.payment_id.is_some()
                    && c.currency == "USD"
                    && c.metadata.get("quote_number").map(String::as_str) == Some("Q-24-06-0003")
            })
            .times(1)
            .returning(|_| {
                Ok(ChargeResult {
                    provider_payment_id: "pi_123".into(),
                    status: PaymentStatus::Pending,
                    client_secret: Some("pi_123_secret".into()),
                    receipt_url: None,
                })
            });
        let (svc, _db) = service(stripe, MockPaymentProvider::new(), MockMailer::new()).await;
        let actor = payer();

        let initiated = svc
            .initiate(&actor, request(PaymentMethod::Stripe))
            .await
            .unwrap()
            .value;
        assert_eq!(initiated.client_secret.as_deref(), Some("pi_123_secret"));
        assert_eq!(initiated.payment.status, PaymentStatus::Pending);
        assert_eq!(initiated.payment.payment_intent_id.as_deref(), Some("pi_123"));
        assert_eq!(
            billing_email(&initiated.payment).as_deref(),
            Some("payer@example.com")
        );
    }

    #[tokio::test]
    async fn stripe_failure_marks_row_failed() {
        let mut stripe = MockPaymentProvider::new();
        stripe
            .expect_charge()
            .returning(|_| Err(ServiceError::UpstreamError("card_declined".into())));
        let (svc, _db) = service(stripe, MockPaymentProvider::new(), MockMailer::new()).await;
        let actor = payer();

        assert_matches!(
            svc.initiate(&actor, request(PaymentMethod::Stripe)).await,
            Err(ServiceError::UpstreamError(_))
        );
        let page = svc.list(&actor, PaymentListFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.payments[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn square_initiation_merges_with_webhook_row() {
        let mut square = MockPaymentProvider::new();
        square.expect_charge().times(1).returning(|_| {
            Ok(ChargeResult {
                provider_payment_id: "sq_1".into(),
                status: PaymentStatus::Completed,
                client_secret: None,
                receipt_url: Some("https://squareup.com/r/1".into()),
            })
        });
        let (svc, db) = service(MockPaymentProvider::new(), square, MockMailer::new()).await;
        let actor = payer();

        // the payment.created webhook recorded it first
        recorded_by_webhook(&db, &actor, "sq_1", PaymentStatus::Completed).await;

        let initiated = svc
            .initiate(&actor, request(PaymentMethod::Square))
            .await
            .unwrap()
            .value;
        assert_eq!(initiated.payment.description.as_deref(), Some("Deposit for Q-24-06-0003"));
        assert_eq!(
            initiated.payment.receipt_url.as_deref(),
            Some("https://squareup.com/r/1")
        );
        let all = svc.list(&actor, PaymentListFilter::default()).await.unwrap();
        assert_eq!(all.total, 1);
    }

    #[tokio::test]
    async fn square_charge_completes_a_pending_webhook_row() {
        let mut square = MockPaymentProvider::new();
        square.expect_charge().times(1).returning(|_| {
            Ok(ChargeResult {
                provider_payment_id: "sq_p".into(),
                status: PaymentStatus::Completed,
                client_secret: None,
                receipt_url: Some("https://squareup.com/r/p".into()),
            })
        });
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|m| m.to == "payer@example.com" && m.subject.contains("confirmation"))
            .times(1)
            .returning(|_| Ok(()));
        let (svc, db) = service(MockPaymentProvider::new(), square, mailer).await;
        let actor = payer();
        let seeded = recorded_by_webhook(&db, &actor, "sq_p", PaymentStatus::Pending).await;

        let outcome = svc
            .initiate(&actor, request(PaymentMethod::Square))
            .await
            .unwrap();
        assert_eq!(outcome.value.payment.id, seeded.id);
        assert_eq!(outcome.value.payment.status, PaymentStatus::Completed);
        assert_eq!(
            outcome.report(SideEffectKind::Email).map(|r| r.status),
            Some(SideEffectStatus::Delivered)
        );

        let stored = find_payment(&*db, seeded.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert_eq!(stored.receipt_url.as_deref(), Some("https://squareup.com/r/p"));
    }

    #[tokio::test]
    async fn square_needs_a_source_and_offline_methods_are_rejected() {
        let (svc, _db) = service(
            MockPaymentProvider::new(),
            MockPaymentProvider::new(),
            MockMailer::new(),
        )
        .await;
        let mut no_source = request(PaymentMethod::Square);
        no_source.source_id = None;
        assert_matches!(
            svc.initiate(&payer(), no_source).await,
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            svc.initiate(&payer(), request(PaymentMethod::BankTransfer)).await,
            Err(ServiceError::ValidationError(_))
        );
        let mut zero = request(PaymentMethod::Stripe);
        zero.amount = Decimal::ZERO;
        assert_matches!(
            svc.initiate(&payer(), zero).await,
            Err(ServiceError::ValidationError(_))
        );
        let owner = payer();
        let mut huge = request(PaymentMethod::Stripe);
        huge.amount = Decimal::MAX;
        assert_matches!(
            svc.initiate(&owner, huge).await,
            Err(ServiceError::ValidationError(_))
        );
        let page = svc.list(&owner, PaymentListFilter::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn refund_is_admin_only_and_needs_completed_payment() {
        let mut stripe = MockPaymentProvider::new();
        stripe.expect_charge().returning(|_| {
            Ok(ChargeResult {
                provider_payment_id: "pi_9".into(),
                status: PaymentStatus::Completed,
                client_secret: None,
                receipt_url: None,
            })
        });
        stripe
            .expect_refund()
            .withf(|r| r.provider_payment_id == "pi_9" && r.amount == Some(dec!(100)))
            .times(1)
            .returning(|_| {
                Ok(RefundResult {
                    refund_id: "re_1".into(),
                    amount: Some(dec!(100)),
                })
            });
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|m| m.to == "payer@example.com" && m.subject.contains("refund"))
            .times(1)
            .returning(|_| Ok(()));
        let (svc, _db) = service(stripe, MockPaymentProvider::new(), mailer).await;
        let actor = payer();
        let id = svc
            .initiate(&actor, request(PaymentMethod::Stripe))
            .await
            .unwrap()
            .value
            .payment
            .id;

        let partial = RefundPaymentRequest {
            amount: Some(dec!(100)),
            reason: Some("Scope reduced".into()),
        };
        assert_matches!(
            svc.refund(&actor, id, partial.clone()).await,
            Err(ServiceError::Forbidden(_))
        );
        let too_much = RefundPaymentRequest {
            amount: Some(dec!(9999)),
            reason: None,
        };
        let admin = Actor::admin(Uuid::new_v4());
        assert_matches!(
            svc.refund(&admin, id, too_much).await,
            Err(ServiceError::ValidationError(_))
        );

        let refunded = svc.refund(&admin, id, partial.clone()).await.unwrap();
        assert_eq!(refunded.value.status, PaymentStatus::Refunded);
        assert_eq!(refunded.value.refunded_amount, Some(dec!(100)));
        assert_eq!(refunded.value.refund_reason.as_deref(), Some("Scope reduced"));
        assert_eq!(
            refunded.report(SideEffectKind::Email).unwrap().status,
            SideEffectStatus::Delivered
        );

        assert_matches!(
            svc.refund(&admin, id, partial).await,
            Err(ServiceError::InvalidState(_))
        );
    }

    #[tokio::test]
    async fn get_is_owner_scoped() {
        let mut stripe = MockPaymentProvider::new();
        stripe.expect_charge().returning(|_| {
            Ok(ChargeResult {
                provider_payment_id: "pi_x".into(),
                status: PaymentStatus::Pending,
                client_secret: None,
                receipt_url: None,
            })
        });
        let (svc, _db) = service(stripe, MockPaymentProvider::new(), MockMailer::new()).await;
        let actor = payer();
        let id = svc
            .initiate(&actor, request(PaymentMethod::Stripe))
            .await
            .unwrap()
            .value
            .payment
            .id;

        assert!(svc.get(&actor, id).await.is_ok());
        assert!(svc.get(&Actor::admin(Uuid::new_v4()), id).await.is_ok());
        assert_matches!(
            svc.get(&payer(), id).await,
            Err(ServiceError::Forbidden(_))
        );
    }
}
