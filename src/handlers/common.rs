use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::services::{page_window, Outcome};
use crate::ApiResponse;

/// 201 with the standard envelope
pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

/// 201 with the side-effect reports of the operation in `meta`
pub fn created_outcome<T: Serialize>(outcome: Outcome<T>) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, Json(ApiResponse::from_outcome(outcome)))
}

/// Pagination parameters for list operations
#[derive(Debug, Default, Deserialize, Serialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PaginationParams {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

impl PaginationParams {
    /// One-based page and clamped page size
    pub fn window(&self) -> (u64, u64) {
        page_window(self.page, self.per_page)
    }
}

/// Standard pagination response metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PaginationMeta {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PaginationMeta {
    pub fn new(page: u64, per_page: u64, total: u64) -> Self {
        let total_pages = if total == 0 || per_page == 0 {
            0
        } else {
            total.div_ceil(per_page)
        };
        Self {
            page,
            per_page,
            total,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(PaginationMeta::new(1, 20, 0).total_pages, 0);
        assert_eq!(PaginationMeta::new(1, 20, 20).total_pages, 1);
        assert_eq!(PaginationMeta::new(2, 20, 41).total_pages, 3);
    }

    #[test]
    fn window_defaults_to_first_page() {
        let params = PaginationParams::default();
        assert_eq!(params.window(), (1, crate::services::DEFAULT_PER_PAGE));
    }
}
