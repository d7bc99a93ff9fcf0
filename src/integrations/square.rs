use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::payments::{
    header_str, ChargeRequest, ChargeResult, PaymentProvider, RefundRequest, RefundResult,
};
use super::{from_minor_units, to_minor_units, upstream_error};
use crate::config::AppConfig;
use crate::entities::payment::{PaymentMethod, PaymentStatus};
use crate::errors::ServiceError;
use crate::tracing::observe_outbound;
use crate::webhooks::signatures::{verify_square_signature, SQUARE_SIGNATURE_HEADER};

pub const SQUARE_API_VERSION: &str = "2024-06-04";

#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub access_token: String,
    pub location_id: Option<String>,
    pub webhook_signature_key: String,
    pub api_base_url: String,
}

impl From<&AppConfig> for SquareConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            access_token: cfg.square_access_token.clone().unwrap_or_default(),
            location_id: cfg.square_location_id.clone(),
            webhook_signature_key: cfg.square_webhook_signature_key.clone().unwrap_or_default(),
            api_base_url: cfg.square_api_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

/// A Square payment as returned by the API and carried in webhooks.
#[derive(Debug, Clone, Deserialize)]
pub struct SquarePayment {
    pub id: String,
    pub status: String,
    pub amount_money: Option<Money>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub receipt_url: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub buyer_email_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquareRefund {
    pub id: String,
    pub status: String,
    pub payment_id: String,
    pub amount_money: Option<Money>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentResponse {
    payment: SquarePayment,
}

#[derive(Debug, Deserialize)]
struct RefundPaymentResponse {
    refund: SquareRefund,
}

/// Maps a Square payment status; `None` for states we do not track.
pub fn payment_status(status: &str) -> Option<PaymentStatus> {
    match status {
        "COMPLETED" => Some(PaymentStatus::Completed),
        "FAILED" | "CANCELED" => Some(PaymentStatus::Failed),
        "APPROVED" | "PENDING" => Some(PaymentStatus::Pending),
        _ => None,
    }
}

/// Longest `reference_id` Square's CreatePayment accepts.
pub const REFERENCE_ID_MAX_LEN: usize = 40;

/// Owner reference sent as a payment's `reference_id`: the hyphenated user id.
pub fn owner_reference(user_id: Uuid) -> String {
    user_id.hyphenated().to_string()
}

/// Reads a bare user id or the `{"userId":"<uuid>"}` form.
pub fn owner_from_reference(reference: &str) -> Option<Uuid> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Reference {
        user_id: Uuid,
    }
    let reference = reference.trim();
    if let Ok(id) = Uuid::parse_str(reference) {
        return Some(id);
    }
    serde_json::from_str::<Reference>(reference)
        .ok()
        .map(|r| r.user_id)
}

/// Square Payments API client
#[derive(Debug, Clone)]
pub struct SquareProvider {
    config: SquareConfig,
    client: reqwest::Client,
}

impl SquareProvider {
    pub fn new(config: SquareConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        if self.config.access_token.is_empty() {
            return Err(ServiceError::UpstreamError(
                "Square is not configured".to_string(),
            ));
        }

        let url = format!("{}{}", self.config.api_base_url, path);
        let response = observe_outbound("square", || {
            self.client
                .post(&url)
                .bearer_auth(&self.config.access_token)
                .header("Square-Version", SQUARE_API_VERSION)
                .json(body)
                .send()
        })
        .await
        .map_err(|e| ServiceError::UpstreamError(format!("Square request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(upstream_error("Square", response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("Invalid Square response: {}", e)))
    }
}

#[async_trait]
impl PaymentProvider for SquareProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Square
    }

    #[instrument(skip(self, request), fields(amount = %request.amount, currency = %request.currency))]
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ServiceError> {
        let source_id = request.source_id.as_deref().ok_or_else(|| {
            ServiceError::ValidationError("source_id is required for Square payments".to_string())
        })?;

        let mut body = json!({
            "source_id": source_id,
            "idempotency_key": request.idempotency_key,
            "amount_money": {
                "amount": to_minor_units(request.amount, &request.currency)?,
                "currency": request.currency.to_uppercase(),
            },
            "reference_id": owner_reference(request.user_id),
            "autocomplete": true,
        });
        if let Some(location_id) = &self.config.location_id {
            body["location_id"] = json!(location_id);
        }
        if let Some(note) = &request.description {
            body["note"] = json!(note);
        }
        if let Some(email) = &request.receipt_email {
            body["buyer_email_address"] = json!(email);
        }

        let created: CreatePaymentResponse = self.post_json("/v2/payments", &body).await?;
        let payment = created.payment;
        info!(square_payment_id = %payment.id, status = %payment.status, "Created Square payment");

        Ok(ChargeResult {
            status: payment_status(&payment.status).unwrap_or(PaymentStatus::Pending),
            provider_payment_id: payment.id,
            client_secret: None,
            receipt_url: payment.receipt_url,
        })
    }

    #[instrument(skip(self, request), fields(square_payment_id = %request.provider_payment_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, ServiceError> {
        let amount = request.amount.ok_or_else(|| {
            ServiceError::ValidationError("Square refunds need an explicit amount".to_string())
        })?;

        let mut body = json!({
            "idempotency_key": request.idempotency_key,
            "payment_id": request.provider_payment_id,
            "amount_money": {
                "amount": to_minor_units(amount, &request.currency)?,
                "currency": request.currency.to_uppercase(),
            },
        });
        if let Some(reason) = &request.reason {
            body["reason"] = json!(reason);
        }

        let refunded: RefundPaymentResponse = self.post_json("/v2/refunds", &body).await?;
        let refund = refunded.refund;
        if matches!(refund.status.as_str(), "REJECTED" | "FAILED") {
            return Err(ServiceError::UpstreamError(format!(
                "Square refund {} ended as {}",
                refund.id, refund.status
            )));
        }

        Ok(RefundResult {
            amount: refund
                .amount_money
                .map(|m| from_minor_units(m.amount, &m.currency)),
            refund_id: refund.id,
        })
    }

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
        _now: i64,
    ) -> Result<(), ServiceError> {
        if self.config.webhook_signature_key.is_empty() {
            return Err(ServiceError::InvalidSignature(
                "Square webhook signature key is not configured".to_string(),
            ));
        }
        verify_square_signature(
            header_str(headers, SQUARE_SIGNATURE_HEADER),
            payload,
            &self.config.webhook_signature_key,
        )
    }
}
