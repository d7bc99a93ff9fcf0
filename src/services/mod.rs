// Quote lifecycle
pub mod estimates;
pub mod meetings;
pub mod quote_numbers;
pub mod quotes;

// Payments
pub mod payment_reconciler;
pub mod payments;

// In-app notifications
pub mod notifications;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

pub const DEFAULT_PER_PAGE: u64 = 20;
pub const MAX_PER_PAGE: u64 = 100;

/// One-based page and clamped page size from optional query values.
pub fn page_window(page: Option<u64>, per_page: Option<u64>) -> (u64, u64) {
    (
        page.unwrap_or(1).max(1),
        per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl From<SortOrder> for sea_orm::Order {
    fn from(order: SortOrder) -> Self {
        match order {
            SortOrder::Asc => sea_orm::Order::Asc,
            SortOrder::Desc => sea_orm::Order::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SideEffectKind {
    Email,
    Notification,
    Pdf,
    CalendarInvite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SideEffectStatus {
    Delivered,
    Failed,
    Skipped,
}

/// What happened to one best-effort side effect of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SideEffectReport {
    pub kind: SideEffectKind,
    pub status: SideEffectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SideEffectReport {
    pub fn delivered(kind: SideEffectKind) -> Self {
        Self {
            kind,
            status: SideEffectStatus::Delivered,
            detail: None,
        }
    }

    pub fn failed(kind: SideEffectKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: SideEffectStatus::Failed,
            detail: Some(detail.into()),
        }
    }

    pub fn skipped(kind: SideEffectKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: SideEffectStatus::Skipped,
            detail: Some(detail.into()),
        }
    }
}

/// Result of a state-changing operation together with the reports of its
/// side effects. A failed side effect never turns the operation into an error.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub side_effects: Vec<SideEffectReport>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            side_effects: Vec::new(),
        }
    }

    pub fn push(&mut self, report: SideEffectReport) {
        if report.status == SideEffectStatus::Failed {
            warn!(
                kind = %report.kind,
                detail = report.detail.as_deref().unwrap_or_default(),
                "side effect failed"
            );
            counter!("side_effects.failed", 1, "kind" => report.kind.to_string());
        }
        self.side_effects.push(report);
    }

    /// Records the result of a best-effort call
    pub fn record<E: std::fmt::Display>(&mut self, kind: SideEffectKind, result: Result<(), E>) {
        match result {
            Ok(()) => self.push(SideEffectReport::delivered(kind)),
            Err(e) => self.push(SideEffectReport::failed(kind, e.to_string())),
        }
    }

    pub fn report(&self, kind: SideEffectKind) -> Option<&SideEffectReport> {
        self.side_effects.iter().find(|r| r.kind == kind)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            side_effects: self.side_effects,
        }
    }

    pub fn into_parts(self) -> (T, Vec<SideEffectReport>) {
        (self.value, self.side_effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_maps_results_to_reports() {
        let mut outcome = Outcome::new(5);
        outcome.record::<String>(SideEffectKind::Email, Ok(()));
        outcome.record(SideEffectKind::Pdf, Err("disk full"));
        outcome.push(SideEffectReport::skipped(
            SideEffectKind::CalendarInvite,
            "no attendees",
        ));

        assert_eq!(
            outcome.report(SideEffectKind::Email).unwrap().status,
            SideEffectStatus::Delivered
        );
        let pdf = outcome.report(SideEffectKind::Pdf).unwrap();
        assert_eq!(pdf.status, SideEffectStatus::Failed);
        assert_eq!(pdf.detail.as_deref(), Some("disk full"));
        assert!(outcome.report(SideEffectKind::Notification).is_none());

        let mapped = outcome.map(|v| v * 2);
        assert_eq!(mapped.value, 10);
        assert_eq!(mapped.side_effects.len(), 3);
    }

    #[test]
    fn page_window_clamps() {
        assert_eq!(page_window(None, None), (1, DEFAULT_PER_PAGE));
        assert_eq!(page_window(Some(0), Some(0)), (1, 1));
        assert_eq!(page_window(Some(3), Some(1000)), (3, MAX_PER_PAGE));
    }

    #[test]
    fn reports_serialize_snake_case() {
        let json = serde_json::to_value(SideEffectReport::delivered(SideEffectKind::CalendarInvite))
            .unwrap();
        assert_eq!(json["kind"], "calendar_invite");
        assert_eq!(json["status"], "delivered");
        assert!(json.get("detail").is_none());
    }
}
