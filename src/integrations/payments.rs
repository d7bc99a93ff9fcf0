use std::collections::BTreeMap;

use async_trait::async_trait;
use http::HeaderMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::entities::payment::{PaymentMethod, PaymentStatus};
use crate::errors::ServiceError;

/// A charge to place with a processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Our payment row, when it exists before the charge
    pub payment_id: Option<Uuid>,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    /// Card nonce or token; Square needs one, Stripe confirms client-side
    pub source_id: Option<String>,
    pub receipt_email: Option<String>,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeResult {
    pub provider_payment_id: String,
    pub status: PaymentStatus,
    /// Stripe client secret the browser confirms the intent with
    pub client_secret: Option<String>,
    pub receipt_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub provider_payment_id: String,
    /// Partial amount; `None` refunds the whole charge
    pub amount: Option<Decimal>,
    pub currency: String,
    pub reason: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundResult {
    pub refund_id: String,
    pub amount: Option<Decimal>,
}

/// A payment processor reached over its REST API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ServiceError>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, ServiceError>;

    /// Checks that a webhook delivery was signed by this processor.
    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
        now: i64,
    ) -> Result<(), ServiceError>;
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
