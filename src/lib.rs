//! VAIF API Library
//!
//! Project estimates, the client quote lifecycle and Stripe/Square payment
//! reconciliation for the VAIF TECH back office.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod integrations;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;
pub mod webhooks;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::HeaderValue,
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    services::ServeDir,
    timeout::TimeoutLayer,
};
use utoipa::ToSchema;

use crate::auth::{AuthRouterExt, AuthService, ADMIN_ROLE};
use crate::handlers::common::PaginationMeta;
use crate::services::{Outcome, SideEffectReport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
    pub auth: Arc<AuthService>,
    pub started_at: DateTime<Utc>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Always `success`; failures use [`errors::ErrorResponse`]
    pub status: String,
    pub data: T,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMeta>,
    /// Best-effort effects of a state change (emails, notifications, PDFs)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<SideEffectReport>,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
            pagination: None,
            side_effects: Vec::new(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data,
            meta: ResponseMeta::capture(),
        }
    }

    pub fn paginated(data: T, pagination: PaginationMeta) -> Self {
        let mut response = Self::success(data);
        response.meta.pagination = Some(pagination);
        response
    }

    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        let (data, side_effects) = outcome.into_parts();
        let mut response = Self::success(data);
        response.meta.side_effects = side_effects;
        response
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    use handlers::{notifications, payment_webhooks, payments, quotes};

    // Client-facing quote actions are reached from the emailed link
    let quotes_public = Router::new()
        .route("/quotes/estimate", post(quotes::estimate_project))
        .route("/quotes/:id/view", get(quotes::view_quote))
        .route("/quotes/:id/accept", post(quotes::accept_quote))
        .route("/quotes/:id/decline", post(quotes::decline_quote));

    let quotes_owner = Router::new()
        .route("/quotes", post(quotes::create_quote).get(quotes::list_quotes))
        .route("/quotes/from-estimate", post(quotes::create_quote_from_estimate))
        .route("/quotes/:id", get(quotes::get_quote).put(quotes::update_quote))
        .route("/quotes/:id/send", post(quotes::send_quote))
        .route("/quotes/:id/archive", post(quotes::archive_quote))
        .route("/quotes/:id/meetings", post(quotes::schedule_meeting))
        .with_auth();

    let quotes_admin = Router::new()
        .route("/quotes/expire", post(quotes::expire_quotes))
        .with_role(ADMIN_ROLE);

    let payments_api = Router::new()
        .route(
            "/payments",
            post(payments::initiate_payment).get(payments::list_payments),
        )
        .route("/payments/:id", get(payments::get_payment))
        .route("/payments/:id/refund", post(payments::refund_payment))
        .with_auth();

    // Authenticated by processor signature, not bearer token
    let payment_webhooks = Router::new()
        .route(
            "/payments/webhooks/stripe",
            post(payment_webhooks::stripe_webhook),
        )
        .route(
            "/payments/webhooks/square",
            post(payment_webhooks::square_webhook),
        );

    let notifications_api = Router::new()
        .route("/notifications", get(notifications::list_notifications))
        .route(
            "/notifications/:id/read",
            post(notifications::mark_notification_read),
        )
        .with_auth();

    Router::new()
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        .merge(quotes_public)
        .merge(quotes_owner)
        .merge(quotes_admin)
        .merge(payments_api)
        .merge(payment_webhooks)
        .merge(notifications_api)
}

/// CORS policy from configuration; `None` when origins are required but missing.
pub fn cors_layer(cfg: &config::AppConfig) -> Option<CorsLayer> {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    if let Some(origins) = configured_origins {
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_credentials(cfg.cors_allow_credentials),
        )
    } else if cfg.should_allow_permissive_cors() {
        ::tracing::info!(
            "Using permissive CORS because explicit origins were not configured ({})",
            if cfg.is_development() {
                "development environment"
            } else {
                "explicit override enabled"
            }
        );
        Some(CorsLayer::permissive())
    } else {
        None
    }
}

/// Full application: v1 API, uploaded PDFs and Swagger UI behind the
/// request-id, tracing, compression, timeout and CORS layers.
pub fn app_router(state: AppState, cors: CorsLayer) -> Router {
    let auth = state.auth.clone();
    let uploads = ServeDir::new(&state.config.upload_dir);

    Router::<AppState>::new()
        .route("/", get(|| async { "vaif-api up" }))
        .nest("/api/v1", api_v1_routes())
        .nest_service("/uploads", uploads)
        .merge(openapi::swagger_ui())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        // Inject AuthService into request extensions for auth middleware
        .layer(Extension(auth))
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> ApiResult<Value> {
    let version = env!("CARGO_PKG_VERSION");
    let git = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    let status_data = json!({
        "status": "ok",
        "version": version,
        "git": git,
        "build_time": build_time,
        "service": "vaif-api",
        "environment": state.config.environment,
        "started_at": state.started_at.to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match db::check_connection(&state.db).await {
        Ok(()) => "healthy",
        Err(e) => {
            ::tracing::warn!(error = %e, "database health check failed");
            "unhealthy"
        }
    };
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    let health_data = json!({
        "status": db_status,
        "checks": {
            "database": db_status,
        },
        "uptime_secs": uptime_secs,
    });

    Ok(Json(ApiResponse::success(health_data)))
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::services::SideEffectKind;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        assert_eq!(response.status, "success");
        assert_eq!(response.meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&response.meta.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn outcome_side_effects_land_in_meta() {
        let mut outcome = Outcome::new(json!({"id": 1}));
        outcome.push(SideEffectReport::failed(SideEffectKind::Email, "smtp down"));

        let json = serde_json::to_value(ApiResponse::from_outcome(outcome)).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["id"], 1);
        assert_eq!(json["meta"]["side_effects"][0]["kind"], "email");
        assert_eq!(json["meta"]["side_effects"][0]["status"], "failed");
        assert!(json["meta"].get("pagination").is_none());
    }

    #[test]
    fn paginated_response_carries_page_meta() {
        let json = serde_json::to_value(ApiResponse::paginated(
            vec![1, 2],
            PaginationMeta::new(1, 2, 5),
        ))
        .unwrap();
        assert_eq!(json["meta"]["pagination"]["total"], 5);
        assert_eq!(json["meta"]["pagination"]["total_pages"], 3);
        assert!(json["meta"].get("side_effects").is_none());
    }
}
