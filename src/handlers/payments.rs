use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;

use super::common::{created_outcome, PaginationMeta};
use crate::auth::Actor;
use crate::entities::payment;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{
    InitiatePaymentRequest, InitiatedPayment, PaymentListFilter, RefundPaymentRequest,
};
use crate::{ApiResponse, ApiResult};

/// Start a Stripe or Square payment
#[utoipa::path(
    post,
    path = "/api/v1/payments",
    request_body = InitiatePaymentRequest,
    responses(
        (status = 201, description = "Payment started", body = crate::ApiResponse<InitiatedPayment>,
            headers(
                ("X-Request-Id" = String, description = "Unique request identifier"),
            )
        ),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 502, description = "Processor rejected the charge", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn initiate_payment(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<InitiatedPayment>>), ServiceError> {
    let outcome = state.services.payments.initiate(&actor, request).await?;
    Ok(created_outcome(outcome))
}

/// List payments visible to the caller
#[utoipa::path(
    get,
    path = "/api/v1/payments",
    params(PaymentListFilter),
    responses(
        (status = 200, description = "Page of payments", body = crate::ApiResponse<Vec<serde_json::Value>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn list_payments(
    State(state): State<AppState>,
    actor: Actor,
    Query(filter): Query<PaymentListFilter>,
) -> ApiResult<Vec<payment::Model>> {
    let page = state.services.payments.list(&actor, filter).await?;
    let meta = PaginationMeta::new(page.page, page.per_page, page.total);
    Ok(Json(ApiResponse::paginated(page.payments, meta)))
}

/// Get payment by ID
#[utoipa::path(
    get,
    path = "/api/v1/payments/:id",
    params(("id" = Uuid, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Payment details", body = crate::ApiResponse<serde_json::Value>),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<payment::Model> {
    let payment = state.services.payments.get(&actor, id).await?;
    Ok(Json(ApiResponse::success(payment)))
}

/// Refund a completed payment
#[utoipa::path(
    post,
    path = "/api/v1/payments/:id/refund",
    params(("id" = Uuid, Path, description = "Payment ID")),
    request_body = RefundPaymentRequest,
    responses(
        (status = 200, description = "Payment refunded", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Payment is not refundable", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Processor rejected the refund", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn refund_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundPaymentRequest>,
) -> ApiResult<payment::Model> {
    let outcome = state.services.payments.refund(&actor, id, request).await?;
    Ok(Json(ApiResponse::from_outcome(outcome)))
}
