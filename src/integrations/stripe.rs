use async_trait::async_trait;
use http::HeaderMap;
use serde::Deserialize;
use tracing::{info, instrument};

use super::payments::{
    header_str, ChargeRequest, ChargeResult, PaymentProvider, RefundRequest, RefundResult,
};
use super::{from_minor_units, to_minor_units, upstream_error};
use crate::config::AppConfig;
use crate::entities::payment::{PaymentMethod, PaymentStatus};
use crate::errors::ServiceError;
use crate::tracing::observe_outbound;
use crate::webhooks::signatures::{verify_stripe_signature, STRIPE_SIGNATURE_HEADER};

/// Stripe's own refund reasons; anything else goes in metadata.
const STRIPE_REFUND_REASONS: &[&str] = &["duplicate", "fraudulent", "requested_by_customer"];

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: u64,
    pub api_base_url: String,
}

impl From<&AppConfig> for StripeConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            secret_key: cfg.stripe_secret_key.clone().unwrap_or_default(),
            webhook_secret: cfg.stripe_webhook_secret.clone().unwrap_or_default(),
            webhook_tolerance_secs: cfg.stripe_webhook_tolerance_secs,
            api_base_url: cfg.stripe_api_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    status: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefundResponse {
    id: String,
    status: Option<String>,
    amount: Option<i64>,
    currency: Option<String>,
}

/// Maps a payment intent status onto ours. Intents waiting on the payer stay pending.
pub fn intent_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Completed,
        "canceled" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// Stripe Payment Intents client
#[derive(Debug, Clone)]
pub struct StripeProvider {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeProvider {
    pub fn new(config: StripeConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn ensure_configured(&self) -> Result<(), ServiceError> {
        if self.config.secret_key.is_empty() {
            return Err(ServiceError::UpstreamError(
                "Stripe is not configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(String, String)],
        idempotency_key: &str,
    ) -> Result<T, ServiceError> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let response = observe_outbound("stripe", || {
            self.client
                .post(&url)
                .basic_auth(&self.config.secret_key, Some(""))
                .header("Idempotency-Key", idempotency_key)
                .form(params)
                .send()
        })
        .await
        .map_err(|e| ServiceError::UpstreamError(format!("Stripe request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(upstream_error("Stripe", response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("Invalid Stripe response: {}", e)))
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Stripe
    }

    #[instrument(skip(self, request), fields(amount = %request.amount, currency = %request.currency))]
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ServiceError> {
        self.ensure_configured()?;

        let mut params = vec![
            (
                "amount".to_string(),
                to_minor_units(request.amount, &request.currency)?.to_string(),
            ),
            ("currency".to_string(), request.currency.to_lowercase()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
            (
                "metadata[user_id]".to_string(),
                request.user_id.to_string(),
            ),
        ];
        if let Some(payment_id) = request.payment_id {
            params.push(("metadata[payment_id]".to_string(), payment_id.to_string()));
        }
        if let Some(description) = &request.description {
            params.push(("description".to_string(), description.clone()));
        }
        if let Some(email) = &request.receipt_email {
            params.push(("receipt_email".to_string(), email.clone()));
        }
        for (key, value) in &request.metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }

        let intent: PaymentIntentResponse = self
            .post_form("/v1/payment_intents", &params, &request.idempotency_key)
            .await?;
        info!(intent_id = %intent.id, status = %intent.status, "Created Stripe payment intent");

        Ok(ChargeResult {
            status: intent_status(&intent.status),
            provider_payment_id: intent.id,
            client_secret: intent.client_secret,
            receipt_url: None,
        })
    }

    #[instrument(skip(self, request), fields(intent_id = %request.provider_payment_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, ServiceError> {
        self.ensure_configured()?;

        let mut params = vec![(
            "payment_intent".to_string(),
            request.provider_payment_id.clone(),
        )];
        if let Some(amount) = request.amount {
            params.push((
                "amount".to_string(),
                to_minor_units(amount, &request.currency)?.to_string(),
            ));
        }
        if let Some(reason) = &request.reason {
            if STRIPE_REFUND_REASONS.contains(&reason.as_str()) {
                params.push(("reason".to_string(), reason.clone()));
            } else {
                params.push(("metadata[reason]".to_string(), reason.clone()));
            }
        }

        let refund: StripeRefundResponse = self
            .post_form("/v1/refunds", &params, &request.idempotency_key)
            .await?;

        if matches!(refund.status.as_deref(), Some("failed") | Some("canceled")) {
            return Err(ServiceError::UpstreamError(format!(
                "Stripe refund {} ended as {}",
                refund.id,
                refund.status.unwrap_or_default()
            )));
        }

        let currency = refund.currency.unwrap_or_else(|| request.currency.clone());
        Ok(RefundResult {
            amount: refund.amount.map(|a| from_minor_units(a, &currency)),
            refund_id: refund.id,
        })
    }

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
        now: i64,
    ) -> Result<(), ServiceError> {
        if self.config.webhook_secret.is_empty() {
            return Err(ServiceError::InvalidSignature(
                "Stripe webhook secret is not configured".to_string(),
            ));
        }
        verify_stripe_signature(
            header_str(headers, STRIPE_SIGNATURE_HEADER),
            payload,
            &self.config.webhook_secret,
            self.config.webhook_tolerance_secs,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: &str) -> StripeProvider {
        StripeProvider::new(
            StripeConfig {
                secret_key: "sk_test_123".into(),
                webhook_secret: "whsec_123".into(),
                webhook_tolerance_secs: 300,
                api_base_url: base.to_string(),
            },
            reqwest::Client::new(),
        )
    }

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            payment_id: Some(Uuid::new_v4()),
            user_id: Uuid::new_v4(),
            amount: dec!(49.99),
            currency: "USD".into(),
            description: Some("Deposit".into()),
            source_id: None,
            receipt_email: None,
            idempotency_key: "idem-1".into(),
            metadata: BTreeMap::from([("quote_id".to_string(), "q-1".to_string())]),
        }
    }

    #[tokio::test]
    async fn charge_posts_form_encoded_intent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header_exists("authorization"))
            .and(header("idempotency-key", "idem-1"))
            .and(body_string_contains("amount=4999"))
            .and(body_string_contains("currency=usd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "pi_123",
                "status": "requires_payment_method",
                "client_secret": "pi_123_secret_abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server.uri()).charge(&charge_request()).await.unwrap();
        assert_eq!(result.provider_payment_id, "pi_123");
        assert_eq!(result.status, PaymentStatus::Pending);
        assert_eq!(result.client_secret.as_deref(), Some("pi_123_secret_abc"));
    }

    #[tokio::test]
    async fn vendor_error_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .respond_with(ResponseTemplate::new(402).set_body_string("card_declined"))
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .charge(&charge_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamError(msg) if msg.contains("402")));
    }

    #[tokio::test]
    async fn refund_converts_amount_back_to_major_units() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .and(body_string_contains("payment_intent=pi_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "re_1",
                "status": "succeeded",
                "amount": 1000,
                "currency": "usd"
            })))
            .mount(&server)
            .await;

        let refund = provider(&server.uri())
            .refund(&RefundRequest {
                provider_payment_id: "pi_123".into(),
                amount: Some(dec!(10)),
                currency: "USD".into(),
                reason: Some("client changed scope".into()),
                idempotency_key: "idem-r".into(),
            })
            .await
            .unwrap();
        assert_eq!(refund.refund_id, "re_1");
        assert_eq!(refund.amount, Some(dec!(10.00)));
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_without_calling_out() {
        let mut p = provider("http://127.0.0.1:9");
        p.config.secret_key.clear();
        assert!(matches!(
            p.charge(&charge_request()).await,
            Err(ServiceError::UpstreamError(_))
        ));
    }

    #[test]
    fn intent_status_mapping() {
        assert_eq!(intent_status("succeeded"), PaymentStatus::Completed);
        assert_eq!(intent_status("canceled"), PaymentStatus::Failed);
        assert_eq!(intent_status("processing"), PaymentStatus::Pending);
    }
}
