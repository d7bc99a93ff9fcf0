//! Typed views of the Stripe and Square webhook payloads the reconciler acts on.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::ServiceError;
use crate::integrations::from_minor_units;
use crate::integrations::square::{SquarePayment, SquareRefund};

#[derive(Debug, Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeData,
}

#[derive(Debug, Deserialize)]
struct StripeData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct ChargeList {
    #[serde(default)]
    data: Vec<ChargeSummary>,
}

#[derive(Debug, Deserialize)]
struct ChargeSummary {
    receipt_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    charges: Option<ChargeList>,
    #[serde(default)]
    last_payment_error: Option<PaymentError>,
}

#[derive(Debug, Deserialize)]
struct PaymentError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundList {
    #[serde(default)]
    data: Vec<RefundSummary>,
}

#[derive(Debug, Deserialize)]
struct RefundSummary {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    payment_intent: Option<String>,
    amount_refunded: i64,
    currency: String,
    receipt_url: Option<String>,
    #[serde(default)]
    refunds: Option<RefundList>,
}

/// What a Stripe delivery asks of us.
#[derive(Debug, Clone, PartialEq)]
pub enum StripeAction {
    PaymentSucceeded {
        intent_id: String,
        receipt_url: Option<String>,
    },
    PaymentFailed {
        intent_id: String,
        reason: Option<String>,
    },
    ChargeRefunded {
        intent_id: Option<String>,
        amount_refunded: Decimal,
        reason: Option<String>,
        receipt_url: Option<String>,
    },
    /// A handled type whose object did not have the expected shape
    Malformed(String),
    /// A type we do not act on
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeEvent {
    pub id: String,
    pub event_type: String,
    pub action: StripeAction,
}

fn object_as<T: for<'de> Deserialize<'de>>(object: Value) -> Result<T, String> {
    serde_json::from_value(object).map_err(|e| e.to_string())
}

impl StripeEvent {
    /// Parses a verified Stripe payload. Only a body that is not a Stripe event
    /// at all is an error; odd objects come back as [`StripeAction::Malformed`].
    pub fn parse(payload: &[u8]) -> Result<Self, ServiceError> {
        let envelope: StripeEnvelope = serde_json::from_slice(payload).map_err(|e| {
            ServiceError::ValidationError(format!("invalid Stripe event payload: {}", e))
        })?;

        let object = envelope.data.object;
        let action = match envelope.event_type.as_str() {
            "payment_intent.succeeded" => match object_as::<PaymentIntentObject>(object) {
                Ok(intent) => StripeAction::PaymentSucceeded {
                    receipt_url: intent
                        .charges
                        .and_then(|c| c.data.into_iter().find_map(|ch| ch.receipt_url)),
                    intent_id: intent.id,
                },
                Err(e) => StripeAction::Malformed(e),
            },
            "payment_intent.payment_failed" => match object_as::<PaymentIntentObject>(object) {
                Ok(intent) => StripeAction::PaymentFailed {
                    reason: intent.last_payment_error.and_then(|e| e.message),
                    intent_id: intent.id,
                },
                Err(e) => StripeAction::Malformed(e),
            },
            "charge.refunded" => match object_as::<ChargeObject>(object) {
                Ok(charge) => StripeAction::ChargeRefunded {
                    amount_refunded: from_minor_units(charge.amount_refunded, &charge.currency),
                    reason: charge
                        .refunds
                        .and_then(|r| r.data.into_iter().find_map(|rf| rf.reason)),
                    intent_id: charge.payment_intent,
                    receipt_url: charge.receipt_url,
                },
                Err(e) => StripeAction::Malformed(e),
            },
            _ => StripeAction::Ignored,
        };

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            action,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SquareEnvelope {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<SquareData>,
}

#[derive(Debug, Deserialize)]
struct SquareData {
    #[serde(default)]
    object: Value,
}

/// What a Square delivery asks of us.
#[derive(Debug, Clone)]
pub enum SquareAction {
    PaymentCreated(SquarePayment),
    PaymentUpdated(SquarePayment),
    Refund(SquareRefund),
    Malformed(String),
    Ignored,
}

#[derive(Debug, Clone)]
pub struct SquareEvent {
    pub id: Option<String>,
    pub event_type: String,
    pub action: SquareAction,
}

impl SquareEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ServiceError> {
        let envelope: SquareEnvelope = serde_json::from_slice(payload).map_err(|e| {
            ServiceError::ValidationError(format!("invalid Square event payload: {}", e))
        })?;

        let object = envelope.data.map(|d| d.object).unwrap_or(Value::Null);
        let action = match envelope.event_type.as_str() {
            "payment.created" | "payment.updated" => {
                match object_as::<SquarePayment>(object.get("payment").cloned().unwrap_or_default())
                {
                    Ok(p) if envelope.event_type == "payment.created" => {
                        SquareAction::PaymentCreated(p)
                    }
                    Ok(p) => SquareAction::PaymentUpdated(p),
                    Err(e) => SquareAction::Malformed(e),
                }
            }
            "refund.created" | "refund.updated" => {
                match object_as::<SquareRefund>(object.get("refund").cloned().unwrap_or_default()) {
                    Ok(r) => SquareAction::Refund(r),
                    Err(e) => SquareAction::Malformed(e),
                }
            }
            _ => SquareAction::Ignored,
        };

        Ok(Self {
            id: envelope.event_id,
            event_type: envelope.event_type,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn bytes(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn stripe_succeeded_picks_receipt_from_charges() {
        let event = StripeEvent::parse(&bytes(json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_1",
                "charges": { "data": [{ "receipt_url": "https://pay.stripe.com/r/1" }] }
            } }
        })))
        .unwrap();
        assert_eq!(
            event.action,
            StripeAction::PaymentSucceeded {
                intent_id: "pi_1".into(),
                receipt_url: Some("https://pay.stripe.com/r/1".into())
            }
        );
    }

    #[test]
    fn stripe_charge_refunded_converts_amount() {
        let event = StripeEvent::parse(&bytes(json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "data": { "object": {
                "id": "ch_1",
                "payment_intent": "pi_1",
                "amount_refunded": 1250,
                "currency": "usd",
                "receipt_url": null,
                "refunds": { "data": [{ "reason": "requested_by_customer" }] }
            } }
        })))
        .unwrap();
        assert_matches!(
            event.action,
            StripeAction::ChargeRefunded { intent_id: Some(ref id), amount_refunded, reason: Some(ref r), .. }
                if id == "pi_1" && amount_refunded == dec!(12.50) && r == "requested_by_customer"
        );
    }

    #[test]
    fn stripe_unknown_type_is_ignored_and_bad_object_is_malformed() {
        let ignored = StripeEvent::parse(&bytes(json!({
            "id": "evt_3", "type": "customer.created", "data": { "object": {} }
        })))
        .unwrap();
        assert_eq!(ignored.action, StripeAction::Ignored);

        let malformed = StripeEvent::parse(&bytes(json!({
            "id": "evt_4", "type": "payment_intent.succeeded", "data": { "object": { "amount": 1 } }
        })))
        .unwrap();
        assert_matches!(malformed.action, StripeAction::Malformed(_));
    }

    #[test]
    fn non_event_body_is_validation_error() {
        assert_matches!(
            StripeEvent::parse(b"not json"),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            SquareEvent::parse(b"[]"),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn square_payment_and_refund_events() {
        let created = SquareEvent::parse(&bytes(json!({
            "event_id": "sq_evt_1",
            "type": "payment.created",
            "data": { "type": "payment", "id": "sq_pay_1", "object": { "payment": {
                "id": "sq_pay_1",
                "status": "APPROVED",
                "amount_money": { "amount": 1000, "currency": "USD" },
                "reference_id": "{\"userId\":\"7f1f2a7e-3d52-4c5e-9a55-0b6f4b7b8a11\"}"
            } } }
        })))
        .unwrap();
        assert_matches!(created.action, SquareAction::PaymentCreated(ref p) if p.id == "sq_pay_1");

        let refund = SquareEvent::parse(&bytes(json!({
            "type": "refund.updated",
            "data": { "object": { "refund": {
                "id": "rf_1", "status": "COMPLETED", "payment_id": "sq_pay_1"
            } } }
        })))
        .unwrap();
        assert_matches!(refund.action, SquareAction::Refund(ref r) if r.status == "COMPLETED");
        assert!(refund.id.is_none());
    }
}
