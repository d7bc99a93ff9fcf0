//! Applies verified Stripe and Square webhook deliveries to stored payments.
//!
//! Every delivery that passes signature verification is acknowledged, whether
//! it changed a payment, repeated an earlier one, or was dropped. Only a bad
//! signature or a body that is not an event at all is refused.

use std::sync::Arc;

use chrono::Utc;
use http::HeaderMap;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::payments::{announce_status, apply_payment_transition, find_payment};
use super::SideEffectReport;
use crate::db::{is_unique_violation, DbPool};
use crate::entities::payment::{
    self, Column, Entity as PaymentEntity, PaymentLineItems, PaymentMethod, PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::from_minor_units;
use crate::integrations::mailer::Mailer;
use crate::integrations::payments::PaymentProvider;
use crate::integrations::square::{owner_from_reference, payment_status, SquarePayment, SquareRefund};
use crate::webhooks::{SquareAction, SquareEvent, StripeAction, StripeEvent};

type ServiceResult<T> = Result<T, ServiceError>;

/// What a verified delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WebhookOutcome {
    /// A payment was created or changed status
    Applied,
    /// The payment already had this state
    Duplicate,
    /// The transition is not legal from the stored status
    Stale,
    /// No stored payment matches the processor reference
    Unmatched,
    /// An event type or state we do not track
    Ignored,
    /// The object was missing data we need
    Dropped,
}

#[derive(Debug, Clone)]
pub struct WebhookReceipt {
    pub provider: PaymentMethod,
    pub event_type: String,
    pub outcome: WebhookOutcome,
    pub payment_id: Option<Uuid>,
    pub side_effects: Vec<SideEffectReport>,
}

struct Applied {
    outcome: WebhookOutcome,
    payment_id: Option<Uuid>,
    side_effects: Vec<SideEffectReport>,
}

impl Applied {
    fn bare(outcome: WebhookOutcome, payment_id: Option<Uuid>) -> Self {
        Self {
            outcome,
            payment_id,
            side_effects: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    mailer: Arc<dyn Mailer>,
    stripe: Arc<dyn PaymentProvider>,
    square: Arc<dyn PaymentProvider>,
}

impl PaymentReconciler {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        mailer: Arc<dyn Mailer>,
        stripe: Arc<dyn PaymentProvider>,
        square: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            db,
            event_sender,
            mailer,
            stripe,
            square,
        }
    }

    #[instrument(skip_all, fields(provider = "stripe"))]
    pub async fn handle_stripe(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> ServiceResult<WebhookReceipt> {
        verified(self.stripe.as_ref(), headers, payload)?;
        let event = StripeEvent::parse(payload)?;
        info!(event_id = %event.id, event_type = %event.event_type, "Stripe webhook received");

        let applied = match event.action {
            StripeAction::PaymentSucceeded {
                intent_id,
                receipt_url,
            } => {
                self.on_stripe_intent(&intent_id, PaymentStatus::Completed, |current| {
                    payment::ActiveModel {
                        receipt_url: Set(receipt_url.clone().or_else(|| current.receipt_url.clone())),
                        ..Default::default()
                    }
                })
                .await?
            }
            StripeAction::PaymentFailed { intent_id, reason } => {
                self.on_stripe_intent(&intent_id, PaymentStatus::Failed, |current| {
                    payment::ActiveModel {
                        metadata: Set(with_failure_reason(current.metadata.clone(), reason.as_deref())),
                        ..Default::default()
                    }
                })
                .await?
            }
            StripeAction::ChargeRefunded {
                intent_id: Some(intent_id),
                amount_refunded,
                reason,
                receipt_url,
            } => {
                self.on_stripe_intent(&intent_id, PaymentStatus::Refunded, |current| {
                    payment::ActiveModel {
                        refunded_amount: Set(Some(amount_refunded)),
                        refund_reason: Set(reason.clone().or_else(|| current.refund_reason.clone())),
                        receipt_url: Set(receipt_url.clone().or_else(|| current.receipt_url.clone())),
                        ..Default::default()
                    }
                })
                .await?
            }
            StripeAction::ChargeRefunded {
                intent_id: None, ..
            } => {
                warn!("Refunded charge carries no payment intent, dropping");
                Applied::bare(WebhookOutcome::Unmatched, None)
            }
            StripeAction::Malformed(detail) => {
                warn!(%detail, "Stripe event object has an unexpected shape, dropping");
                Applied::bare(WebhookOutcome::Dropped, None)
            }
            StripeAction::Ignored => Applied::bare(WebhookOutcome::Ignored, None),
        };

        Ok(self.receipt(PaymentMethod::Stripe, event.event_type, applied))
    }

    #[instrument(skip_all, fields(provider = "square"))]
    pub async fn handle_square(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> ServiceResult<WebhookReceipt> {
        verified(self.square.as_ref(), headers, payload)?;
        let event = SquareEvent::parse(payload)?;
        info!(event_id = ?event.id, event_type = %event.event_type, "Square webhook received");

        let applied = match event.action {
            SquareAction::PaymentCreated(p) => self.on_square_created(p).await?,
            SquareAction::PaymentUpdated(p) => self.on_square_updated(p).await?,
            SquareAction::Refund(r) => self.on_square_refund(r).await?,
            SquareAction::Malformed(detail) => {
                warn!(%detail, "Square event object has an unexpected shape, dropping");
                Applied::bare(WebhookOutcome::Dropped, None)
            }
            SquareAction::Ignored => Applied::bare(WebhookOutcome::Ignored, None),
        };

        Ok(self.receipt(PaymentMethod::Square, event.event_type, applied))
    }

    fn receipt(&self, provider: PaymentMethod, event_type: String, applied: Applied) -> WebhookReceipt {
        info!(%provider, %event_type, outcome = %applied.outcome, payment_id = ?applied.payment_id, "Webhook handled");
        counter!(
            "webhooks.handled",
            1,
            "provider" => provider.to_string(),
            "outcome" => applied.outcome.to_string()
        );
        self.event_sender.publish(Event::WebhookHandled {
            provider: provider.to_string(),
            event_type: event_type.clone(),
            outcome: applied.outcome.to_string(),
        });
        WebhookReceipt {
            provider,
            event_type,
            outcome: applied.outcome,
            payment_id: applied.payment_id,
            side_effects: applied.side_effects,
        }
    }

    async fn on_stripe_intent(
        &self,
        intent_id: &str,
        to: PaymentStatus,
        changes: impl FnOnce(&payment::Model) -> payment::ActiveModel,
    ) -> ServiceResult<Applied> {
        let found = PaymentEntity::find()
            .filter(Column::PaymentIntentId.eq(intent_id))
            .one(&*self.db)
            .await?;
        match found {
            Some(current) => {
                let extra = changes(&current);
                self.move_to(current, to, extra).await
            }
            None => {
                warn!(%intent_id, "No payment for Stripe intent, dropping");
                Ok(Applied::bare(WebhookOutcome::Unmatched, None))
            }
        }
    }

    /// Moves `current` to `to` with a conditional update. Same-status deliveries
    /// and illegal moves change nothing; entering `completed` or `refunded`
    /// announces the payment to its owner.
    async fn move_to(
        &self,
        current: payment::Model,
        to: PaymentStatus,
        mut changes: payment::ActiveModel,
    ) -> ServiceResult<Applied> {
        let from = current.status;
        if from == to {
            return Ok(Applied::bare(WebhookOutcome::Duplicate, Some(current.id)));
        }
        if !from.can_transition_to(to) {
            warn!(payment_id = %current.id, %from, %to, "Ignoring out-of-order payment status");
            return Ok(Applied::bare(WebhookOutcome::Stale, Some(current.id)));
        }

        changes.status = Set(to);
        changes.updated_at = Set(Utc::now());
        if !apply_payment_transition(&*self.db, current.id, from, changes).await? {
            let stored = find_payment(&*self.db, current.id).await?;
            let outcome = if stored.status == to {
                WebhookOutcome::Duplicate
            } else {
                WebhookOutcome::Stale
            };
            return Ok(Applied::bare(outcome, Some(stored.id)));
        }

        let stored = find_payment(&*self.db, current.id).await?;
        info!(payment_id = %stored.id, %from, %to, "Payment status changed");
        self.event_sender.publish(Event::PaymentStatusChanged {
            payment_id: stored.id,
            from,
            to,
        });
        let side_effects = announce_status(&self.db, self.mailer.as_ref(), &stored).await;
        Ok(Applied {
            outcome: WebhookOutcome::Applied,
            payment_id: Some(stored.id),
            side_effects,
        })
    }

    async fn find_square(&self, square_id: &str) -> ServiceResult<Option<payment::Model>> {
        Ok(PaymentEntity::find()
            .filter(Column::SquarePaymentId.eq(square_id))
            .one(&*self.db)
            .await?)
    }

    async fn on_square_created(&self, p: SquarePayment) -> ServiceResult<Applied> {
        if let Some(existing) = self.find_square(&p.id).await? {
            return Ok(Applied::bare(WebhookOutcome::Duplicate, Some(existing.id)));
        }

        let Some(user_id) = p.reference_id.as_deref().and_then(owner_from_reference) else {
            warn!(square_payment_id = %p.id, reference = ?p.reference_id, "Square payment has no owner reference, dropping");
            return Ok(Applied::bare(WebhookOutcome::Dropped, None));
        };
        let Some(money) = p.amount_money.as_ref() else {
            warn!(square_payment_id = %p.id, "Square payment has no amount, dropping");
            return Ok(Applied::bare(WebhookOutcome::Dropped, None));
        };

        let now = Utc::now();
        let row = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            amount: Set(from_minor_units(money.amount, &money.currency)),
            currency: Set(money.currency.to_uppercase()),
            status: Set(payment_status(&p.status).unwrap_or(PaymentStatus::Pending)),
            payment_method: Set(PaymentMethod::Square),
            payment_intent_id: Set(None),
            square_payment_id: Set(Some(p.id.clone())),
            description: Set(p.note.clone()),
            metadata: Set(None),
            line_items: Set(PaymentLineItems::default()),
            billing_details: Set(p
                .buyer_email_address
                .as_ref()
                .map(|email| json!({ "email": email }))),
            receipt_url: Set(p.receipt_url.clone()),
            refunded_amount: Set(None),
            refund_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let saved = match row.insert(&*self.db).await {
            Ok(saved) => saved,
            Err(e) if is_unique_violation(&e) => {
                info!(square_payment_id = %p.id, "Square payment recorded concurrently");
                let existing = self.find_square(&p.id).await?;
                return Ok(Applied::bare(
                    WebhookOutcome::Duplicate,
                    existing.map(|m| m.id),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        info!(payment_id = %saved.id, square_payment_id = %p.id, status = %saved.status, "Recorded Square payment from webhook");
        self.event_sender.publish(Event::PaymentCreated {
            payment_id: saved.id,
            status: saved.status,
        });
        let side_effects = announce_status(&self.db, self.mailer.as_ref(), &saved).await;
        Ok(Applied {
            outcome: WebhookOutcome::Applied,
            payment_id: Some(saved.id),
            side_effects,
        })
    }

    async fn on_square_updated(&self, p: SquarePayment) -> ServiceResult<Applied> {
        let Some(current) = self.find_square(&p.id).await? else {
            warn!(square_payment_id = %p.id, "No payment for Square update, dropping");
            return Ok(Applied::bare(WebhookOutcome::Unmatched, None));
        };
        let Some(to) = payment_status(&p.status) else {
            return Ok(Applied::bare(WebhookOutcome::Ignored, Some(current.id)));
        };

        let changes = payment::ActiveModel {
            receipt_url: Set(p.receipt_url.clone().or_else(|| current.receipt_url.clone())),
            ..Default::default()
        };
        self.move_to(current, to, changes).await
    }

    async fn on_square_refund(&self, r: SquareRefund) -> ServiceResult<Applied> {
        if r.status != "COMPLETED" {
            return Ok(Applied::bare(WebhookOutcome::Ignored, None));
        }
        let Some(current) = self.find_square(&r.payment_id).await? else {
            warn!(square_payment_id = %r.payment_id, refund_id = %r.id, "No payment for Square refund, dropping");
            return Ok(Applied::bare(WebhookOutcome::Unmatched, None));
        };

        let amount: Decimal = r
            .amount_money
            .as_ref()
            .map(|m| from_minor_units(m.amount, &m.currency))
            .unwrap_or(current.amount);
        let changes = payment::ActiveModel {
            refunded_amount: Set(Some(amount)),
            refund_reason: Set(r.reason.clone().or_else(|| current.refund_reason.clone())),
            ..Default::default()
        };
        self.move_to(current, PaymentStatus::Refunded, changes).await
    }
}

fn verified(
    provider: &dyn PaymentProvider,
    headers: &HeaderMap,
    payload: &[u8],
) -> ServiceResult<()> {
    provider
        .verify_webhook(headers, payload, Utc::now().timestamp())
        .map_err(|e| {
            warn!(provider = %provider.method(), error = %e, "Rejected webhook signature");
            counter!("webhooks.rejected", 1, "provider" => provider.method().to_string());
            e
        })
}

fn with_failure_reason(metadata: Option<Value>, reason: Option<&str>) -> Option<Value> {
    let Some(reason) = reason else {
        return metadata;
    };
    let mut object = match metadata {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    object.insert("failure_reason".to_string(), json!(reason));
    Some(Value::Object(object))
}
