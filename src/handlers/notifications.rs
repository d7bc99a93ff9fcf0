use axum::extract::{Json, Path, Query, State};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use super::common::PaginationMeta;
use crate::auth::Actor;
use crate::entities::notification;
use crate::handlers::AppState;
use crate::services::page_window;
use crate::{ApiResponse, ApiResult};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct NotificationQuery {
    /// Only unread notifications
    #[serde(default)]
    pub unread: bool,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

/// The caller's notifications, newest first
#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    params(NotificationQuery),
    responses(
        (status = 200, description = "Page of notifications", body = crate::ApiResponse<Vec<notification::Model>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Vec<notification::Model>> {
    let (page, per_page) = page_window(query.page, query.per_page);
    let (items, total) = state
        .services
        .notifications
        .list(&actor, query.unread, page, per_page)
        .await?;
    Ok(Json(ApiResponse::paginated(
        items,
        PaginationMeta::new(page, per_page, total),
    )))
}

/// Mark one of the caller's notifications as read
#[utoipa::path(
    post,
    path = "/api/v1/notifications/:id/read",
    params(("id" = Uuid, Path, description = "Notification ID")),
    responses(
        (status = 200, description = "Notification marked as read", body = crate::ApiResponse<notification::Model>),
        (status = 403, description = "Not the recipient", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn mark_notification_read(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<notification::Model> {
    let read = state.services.notifications.mark_read(&actor, id).await?;
    Ok(Json(ApiResponse::success(read)))
}
