//! Outbound collaborators: payment processors, transactional email, PDF
//! rendering and the project analyzer. Each sits behind a small trait so the
//! services can be exercised without the vendor.

pub mod analyzer;
pub mod mailer;
pub mod payments;
pub mod pdf;
pub mod square;
pub mod stripe;

use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::errors::ServiceError;

pub use analyzer::{OpenAiAnalyzer, ProjectAnalyzer};
pub use mailer::{EmailAttachment, EmailMessage, HttpMailer, LogMailer, Mailer};
pub use payments::{ChargeRequest, ChargeResult, PaymentProvider, RefundRequest, RefundResult};
pub use pdf::{FilePdfRenderer, QuoteRenderer};
pub use square::SquareProvider;
pub use stripe::StripeProvider;

/// Shared `reqwest` client with the configured request timeout.
pub fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(concat!("vaif-api/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ServiceError::InternalError(format!("Failed to build HTTP client: {}", e)))
}

/// Currencies whose smallest unit is the whole unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

fn minor_unit_scale(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
    {
        0
    } else {
        2
    }
}

/// Converts a major-unit amount into the integer minor units processors expect.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    amount
        .checked_mul(Decimal::from(10_i64.pow(minor_unit_scale(currency))))
        .and_then(|scaled| scaled.round().to_i64())
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            ServiceError::ValidationError(format!("amount {} is not chargeable", amount))
        })
}

pub fn from_minor_units(amount: i64, currency: &str) -> Decimal {
    Decimal::new(amount, minor_unit_scale(currency))
}

/// Reads a vendor error body into an `UpstreamError`.
pub(crate) async fn upstream_error(vendor: &str, response: reqwest::Response) -> ServiceError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(300).collect();
    ServiceError::UpstreamError(format!("{} returned {}: {}", vendor, status, snippet))
}
