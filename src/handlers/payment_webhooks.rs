//! Processor webhook endpoints. The body is taken raw because both
//! signatures are computed over the exact bytes that were sent.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::services::payment_reconciler::{WebhookOutcome, WebhookReceipt};
use crate::AppState;

/// Acknowledgement returned for every verified delivery
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl From<WebhookReceipt> for WebhookAck {
    fn from(receipt: WebhookReceipt) -> Self {
        Self {
            received: true,
            outcome: receipt.outcome,
        }
    }
}

// POST /api/v1/payments/webhooks/stripe
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhooks/stripe",
    request_body(content = String, description = "Raw Stripe event", content_type = "application/json"),
    params(("stripe-signature" = String, Header, description = "t=<unix>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Webhook accepted", body = WebhookAck),
        (status = 400, description = "Invalid signature or payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Webhooks"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), ServiceError> {
    let receipt = state.services.reconciler.handle_stripe(&headers, &body).await?;
    Ok((StatusCode::OK, Json(receipt.into())))
}

// POST /api/v1/payments/webhooks/square
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhooks/square",
    request_body(content = String, description = "Raw Square event", content_type = "application/json"),
    params(("x-square-signature" = String, Header, description = "base64 HMAC-SHA256 of the raw body")),
    responses(
        (status = 200, description = "Webhook accepted", body = WebhookAck),
        (status = 400, description = "Invalid signature or payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Webhooks"
)]
pub async fn square_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), ServiceError> {
    let receipt = state.services.reconciler.handle_square(&headers, &body).await?;
    Ok((StatusCode::OK, Json(receipt.into())))
}
