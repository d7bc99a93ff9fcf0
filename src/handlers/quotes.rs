use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{created_outcome, PaginationMeta};
use crate::auth::Actor;
use crate::entities::quote;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::estimates::{Estimate, EstimateInput};
use crate::services::meetings::ScheduleMeetingRequest;
use crate::services::quotes::{
    CreateQuoteRequest, QuoteFromEstimateRequest, QuoteListFilter, ScheduledMeeting,
    UpdateQuoteRequest,
};
use crate::{ApiResponse, ApiResult};

/// Body of `POST /quotes/:id/decline`
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct DeclineQuoteRequest {
    #[schema(example = "Budget moved to next quarter")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExpiredQuotes {
    /// Quotes moved to `expired` by this sweep
    pub expired: u64,
}

/// Create a draft quote
#[utoipa::path(
    post,
    path = "/api/v1/quotes",
    request_body = CreateQuoteRequest,
    responses(
        (status = 201, description = "Quote created", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Missing or invalid fields", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 409, description = "Quote number could not be allocated", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn create_quote(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateQuoteRequest>,
) -> Result<(StatusCode, Json<ApiResponse<quote::Model>>), ServiceError> {
    let outcome = state.services.quotes.create(&actor, request).await?;
    Ok(created_outcome(outcome))
}

/// List quotes visible to the caller
#[utoipa::path(
    get,
    path = "/api/v1/quotes",
    params(QuoteListFilter),
    responses(
        (status = 200, description = "Page of quotes", body = crate::ApiResponse<Vec<serde_json::Value>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn list_quotes(
    State(state): State<AppState>,
    actor: Actor,
    Query(filter): Query<QuoteListFilter>,
) -> ApiResult<Vec<quote::Model>> {
    let page = state.services.quotes.list(&actor, filter).await?;
    let meta = PaginationMeta::new(page.page, page.per_page, page.total);
    Ok(Json(ApiResponse::paginated(page.quotes, meta)))
}

/// Get a quote by ID
#[utoipa::path(
    get,
    path = "/api/v1/quotes/:id",
    params(("id" = Uuid, Path, description = "Quote ID")),
    responses(
        (status = 200, description = "Quote", body = crate::ApiResponse<serde_json::Value>),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn get_quote(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<quote::Model> {
    let quote = state.services.quotes.get(&actor, id).await?;
    Ok(Json(ApiResponse::success(quote)))
}

/// Edit an open quote
#[utoipa::path(
    put,
    path = "/api/v1/quotes/:id",
    params(("id" = Uuid, Path, description = "Quote ID")),
    request_body = UpdateQuoteRequest,
    responses(
        (status = 200, description = "Quote updated", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Quote is no longer editable", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn update_quote(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(patch): Json<UpdateQuoteRequest>,
) -> ApiResult<quote::Model> {
    let outcome = state.services.quotes.update(&actor, id, patch).await?;
    Ok(Json(ApiResponse::from_outcome(outcome)))
}

/// Send a draft quote to the client
#[utoipa::path(
    post,
    path = "/api/v1/quotes/:id/send",
    params(("id" = Uuid, Path, description = "Quote ID")),
    responses(
        (status = 200, description = "Quote sent", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Quote is not a draft", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn send_quote(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<quote::Model> {
    let outcome = state.services.quotes.send(&actor, id).await?;
    Ok(Json(ApiResponse::from_outcome(outcome)))
}

/// Client opens a sent quote
#[utoipa::path(
    get,
    path = "/api/v1/quotes/:id/view",
    params(("id" = Uuid, Path, description = "Quote ID")),
    responses(
        (status = 200, description = "Quote marked as viewed", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Quote is not awaiting a first view", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Quotes"
)]
pub async fn view_quote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<quote::Model> {
    let outcome = state.services.quotes.mark_viewed(id).await?;
    Ok(Json(ApiResponse::from_outcome(outcome)))
}

/// Client accepts a quote
#[utoipa::path(
    post,
    path = "/api/v1/quotes/:id/accept",
    params(("id" = Uuid, Path, description = "Quote ID")),
    responses(
        (status = 200, description = "Quote accepted", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Quote is expired or not awaiting the client", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Quotes"
)]
pub async fn accept_quote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<quote::Model> {
    let outcome = state.services.quotes.accept(id).await?;
    Ok(Json(ApiResponse::from_outcome(outcome)))
}

/// Client declines a quote
#[utoipa::path(
    post,
    path = "/api/v1/quotes/:id/decline",
    params(("id" = Uuid, Path, description = "Quote ID")),
    request_body(content = DeclineQuoteRequest, description = "Optional reason"),
    responses(
        (status = 200, description = "Quote declined", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Quote is not awaiting the client", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Quotes"
)]
pub async fn decline_quote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DeclineQuoteRequest>>,
) -> ApiResult<quote::Model> {
    let reason = body.and_then(|Json(b)| b.reason);
    let outcome = state.services.quotes.decline(id, reason).await?;
    Ok(Json(ApiResponse::from_outcome(outcome)))
}

/// Archive a quote
#[utoipa::path(
    post,
    path = "/api/v1/quotes/:id/archive",
    params(("id" = Uuid, Path, description = "Quote ID")),
    responses(
        (status = 200, description = "Quote archived", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Already archived", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn archive_quote(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<quote::Model> {
    let quote = state.services.quotes.archive(&actor, id).await?;
    Ok(Json(ApiResponse::success(quote)))
}

/// Book a meeting with the client
#[utoipa::path(
    post,
    path = "/api/v1/quotes/:id/meetings",
    params(("id" = Uuid, Path, description = "Quote ID")),
    request_body = ScheduleMeetingRequest,
    responses(
        (status = 201, description = "Meeting scheduled", body = crate::ApiResponse<ScheduledMeeting>),
        (status = 400, description = "Invalid meeting or archived quote", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn schedule_meeting(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<ScheduleMeetingRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ScheduledMeeting>>), ServiceError> {
    let outcome = state
        .services
        .quotes
        .schedule_meeting(&actor, id, request)
        .await?;
    Ok(created_outcome(outcome))
}

/// Price a project from catalog selections
#[utoipa::path(
    post,
    path = "/api/v1/quotes/estimate",
    request_body = EstimateInput,
    responses(
        (status = 200, description = "Estimated price range", body = crate::ApiResponse<Estimate>),
        (status = 400, description = "Unknown catalog code", body = crate::errors::ErrorResponse)
    ),
    tag = "Quotes"
)]
pub async fn estimate_project(
    State(state): State<AppState>,
    Json(input): Json<EstimateInput>,
) -> ApiResult<Estimate> {
    let estimate = state.services.quotes.estimate(&input).await?;
    Ok(Json(ApiResponse::success(estimate)))
}

/// Create a draft quote straight from an estimate
#[utoipa::path(
    post,
    path = "/api/v1/quotes/from-estimate",
    request_body = QuoteFromEstimateRequest,
    responses(
        (status = 201, description = "Quote created", body = crate::ApiResponse<serde_json::Value>),
        (status = 400, description = "Invalid client or selections", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn create_quote_from_estimate(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<QuoteFromEstimateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<quote::Model>>), ServiceError> {
    let outcome = state
        .services
        .quotes
        .create_from_estimate(&actor, request)
        .await?;
    Ok(created_outcome(outcome))
}

/// Expire every open quote past its validity date
#[utoipa::path(
    post,
    path = "/api/v1/quotes/expire",
    responses(
        (status = 200, description = "Sweep finished", body = crate::ApiResponse<ExpiredQuotes>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Quotes"
)]
pub async fn expire_quotes(State(state): State<AppState>) -> ApiResult<ExpiredQuotes> {
    let expired = state.services.quotes.expire_overdue(Utc::now()).await?;
    Ok(Json(ApiResponse::success(ExpiredQuotes { expired })))
}
