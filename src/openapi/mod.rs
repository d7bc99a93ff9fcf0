use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::entities::{meeting, payment, quote};
use crate::handlers::{notifications, payment_webhooks, payments, quotes};
use crate::services;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "VAIF API",
        version = "1.0.0",
        description = r#"
# VAIF TECH back-office API

Quotes for client software projects, from first estimate to acceptance, and
the payments that follow them.

## Features

- **Estimates**: price a project from catalog selections, optionally refined by AI analysis
- **Quotes**: numbered drafts, PDF rendering, emailed links, client view/accept/decline, expiry
- **Meetings**: schedule calls against a quote and send calendar invites
- **Payments**: Stripe and Square checkout, refunds, webhook reconciliation
- **Notifications**: in-app notices for quote owners

## Authentication

Owner endpoints take a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

Client actions on a quote (`view`, `accept`, `decline`) and the estimate
calculator are public. Webhooks are authenticated by processor signature.

## Responses

Successful calls return `{"status": "success", "data": ..., "meta": {...}}`.
`meta.side_effects` lists emails, notifications and PDFs that were attempted;
a failed side effect never fails the call.

Errors return:

```json
{
  "status": "fail",
  "error": "Bad Request",
  "message": "Invalid state: cannot send while status is 'accepted'",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-06-15T10:30:00Z"
}
```
        "#,
        contact(
            name = "VAIF TECH",
            email = "support@vaif.tech"
        ),
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Quotes", description = "Quote lifecycle, estimates and meetings"),
        (name = "Payments", description = "Stripe and Square payments"),
        (name = "Webhooks", description = "Processor webhook receivers"),
        (name = "Notifications", description = "In-app notifications")
    ),
    paths(
        quotes::create_quote,
        quotes::list_quotes,
        quotes::get_quote,
        quotes::update_quote,
        quotes::send_quote,
        quotes::view_quote,
        quotes::accept_quote,
        quotes::decline_quote,
        quotes::archive_quote,
        quotes::schedule_meeting,
        quotes::estimate_project,
        quotes::create_quote_from_estimate,
        quotes::expire_quotes,
        payments::initiate_payment,
        payments::list_payments,
        payments::get_payment,
        payments::refund_payment,
        payment_webhooks::stripe_webhook,
        payment_webhooks::square_webhook,
        notifications::list_notifications,
        notifications::mark_notification_read,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::ResponseMeta,
            crate::handlers::common::PaginationMeta,
            services::SideEffectReport,
            services::SideEffectKind,
            services::SideEffectStatus,
            services::SortOrder,
            services::quotes::CreateQuoteRequest,
            services::quotes::UpdateQuoteRequest,
            services::quotes::QuoteFromEstimateRequest,
            services::quotes::QuoteSortField,
            services::estimates::EstimateInput,
            services::estimates::Estimate,
            services::meetings::ScheduleMeetingRequest,
            services::payments::InitiatePaymentRequest,
            services::payments::RefundPaymentRequest,
            services::payment_reconciler::WebhookOutcome,
            quotes::DeclineQuoteRequest,
            quotes::ExpiredQuotes,
            payment_webhooks::WebhookAck,
            quote::QuoteStatus,
            quote::ClientInfo,
            quote::ProjectDetails,
            quote::QuoteItem,
            payment::PaymentStatus,
            payment::PaymentMethod,
            payment::PaymentLineItem,
            meeting::Attendee,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_every_route_group() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("VAIF API"));
        assert!(json.contains("/api/v1/quotes"));
        assert!(json.contains("/api/v1/payments/webhooks/stripe"));
        assert!(json.contains("/api/v1/notifications"));
        assert!(json.contains("bearer_auth"));
    }
}
