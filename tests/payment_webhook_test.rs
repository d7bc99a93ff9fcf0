mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{json_body, TestApp, OWNER_EMAIL, SQUARE_SIGNATURE_KEY, STRIPE_WEBHOOK_SECRET};
use vaif_api::integrations::square::owner_reference;
use vaif_api::webhooks::signatures::{sign_square_payload, sign_stripe_payload};
use vaif_api::webhooks::{SQUARE_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER};

const STRIPE_WEBHOOK: &str = "/api/v1/payments/webhooks/stripe";
const SQUARE_WEBHOOK: &str = "/api/v1/payments/webhooks/square";

async fn deliver_stripe(app: &TestApp, event: &Value) -> axum::response::Response {
    let payload = serde_json::to_vec(event).unwrap();
    let signature = sign_stripe_payload(&payload, STRIPE_WEBHOOK_SECRET, Utc::now().timestamp());
    app.post_raw(STRIPE_WEBHOOK, payload, &[(STRIPE_SIGNATURE_HEADER, &signature)])
        .await
}

async fn deliver_square(app: &TestApp, event: &Value) -> axum::response::Response {
    let payload = serde_json::to_vec(event).unwrap();
    let signature = sign_square_payload(&payload, SQUARE_SIGNATURE_KEY);
    app.post_raw(SQUARE_WEBHOOK, payload, &[(SQUARE_SIGNATURE_HEADER, &signature)])
        .await
}

async fn owner_payments(app: &TestApp) -> Value {
    let response = app
        .request(Method::GET, "/api/v1/payments", None, Some(app.owner_token()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

fn square_payment_created(app: &TestApp, square_id: &str) -> Value {
    json!({
        "event_id": format!("evt-{}", square_id),
        "type": "payment.created",
        "data": { "object": { "payment": {
            "id": square_id,
            "status": "COMPLETED",
            "amount_money": { "amount": 12500, "currency": "USD" },
            "reference_id": owner_reference(app.owner_id),
            "buyer_email_address": "buyer@example.com"
        }}}
    })
}

#[tokio::test]
async fn stripe_intent_is_created_then_completed_by_webhook() {
    let app = TestApp::new().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header("Idempotency-Key", "checkout-1"))
        .and(body_string_contains("amount=25000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_test_1",
            "status": "requires_payment_method",
            "client_secret": "pi_test_1_secret_abc"
        })))
        .expect(1)
        .mount(&app.vendor)
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({
                "amount": "250.00",
                "payment_method": "stripe",
                "description": "Deposit for Q-24-06-0001",
                "idempotency_key": "checkout-1"
            })),
            Some(app.owner_token()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let initiated = json_body(response).await["data"].clone();
    assert_eq!(initiated["client_secret"], "pi_test_1_secret_abc");
    assert_eq!(initiated["payment"]["status"], "pending");
    assert_eq!(initiated["payment"]["payment_intent_id"], "pi_test_1");
    let payment_id = initiated["payment"]["id"].as_str().unwrap().to_string();

    let succeeded = json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": "pi_test_1",
            "charges": { "data": [{ "receipt_url": "https://pay.stripe.com/r/1" }] }
        }}
    });
    let response = deliver_stripe(&app, &succeeded).await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = json_body(response).await;
    assert_eq!(ack["received"], true);
    assert_eq!(ack["outcome"], "applied");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/{}", payment_id),
            None,
            Some(app.owner_token()),
        )
        .await;
    let stored = json_body(response).await["data"].clone();
    assert_eq!(stored["status"], "completed");
    assert_eq!(stored["receipt_url"], "https://pay.stripe.com/r/1");

    // Redelivery changes nothing and sends no second receipt
    let response = deliver_stripe(&app, &succeeded).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "duplicate");
    assert_eq!(app.mailer.sent_to(OWNER_EMAIL).len(), 1);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/{}", payment_id),
            None,
            Some(app.other_token()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stripe_webhook_with_stale_timestamp_is_rejected() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&json!({
        "id": "evt_old", "type": "payment_intent.succeeded", "data": { "object": { "id": "pi_x" } }
    }))
    .unwrap();
    let an_hour_ago = Utc::now().timestamp() - 3600;
    let signature = sign_stripe_payload(&payload, STRIPE_WEBHOOK_SECRET, an_hour_ago);

    let response = app
        .post_raw(STRIPE_WEBHOOK, payload, &[(STRIPE_SIGNATURE_HEADER, &signature)])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_intent_and_event_types_are_acknowledged() {
    let app = TestApp::new().await;

    let response = deliver_stripe(
        &app,
        &json!({
            "id": "evt_2", "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_nobody" } }
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "unmatched");

    let response = deliver_stripe(
        &app,
        &json!({ "id": "evt_3", "type": "customer.created", "data": { "object": {} } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "ignored");
}

#[tokio::test]
async fn square_webhook_with_bad_signature_records_nothing() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&square_payment_created(&app, "sq_forged")).unwrap();
    let forged = sign_square_payload(&payload, "not-the-key");

    let response = app
        .post_raw(SQUARE_WEBHOOK, payload.clone(), &[(SQUARE_SIGNATURE_HEADER, &forged)])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["status"], "fail");

    let response = app.post_raw(SQUARE_WEBHOOK, payload, &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(owner_payments(&app).await["meta"]["pagination"]["total"], 0);
}

#[tokio::test]
async fn repeated_square_creation_records_one_payment() {
    let app = TestApp::new().await;
    let event = square_payment_created(&app, "sq_pay_1");

    let response = deliver_square(&app, &event).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "applied");

    let response = deliver_square(&app, &event).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "duplicate");

    let listed = owner_payments(&app).await;
    assert_eq!(listed["meta"]["pagination"]["total"], 1);
    let payment = &listed["data"][0];
    assert_eq!(payment["square_payment_id"], "sq_pay_1");
    assert_eq!(payment["status"], "completed");
    assert_eq!(payment["payment_method"], "square");
}

#[tokio::test]
async fn square_checkout_followed_by_its_webhook_stays_single() {
    let app = TestApp::new().await;
    Mock::given(method("POST"))
        .and(path("/v2/payments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payment": {
                "id": "sq_pay_2",
                "status": "COMPLETED",
                "amount_money": { "amount": 12500, "currency": "USD" },
                "receipt_url": "https://squareup.com/receipt/preview/sq_pay_2"
            }
        })))
        .expect(1)
        .mount(&app.vendor)
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "amount": "125.00", "payment_method": "square" })),
            Some(app.owner_token()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({
                "amount": "125.00",
                "payment_method": "square",
                "source_id": "cnon:card-nonce-ok"
            })),
            Some(app.owner_token()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let initiated = json_body(response).await["data"].clone();
    assert_eq!(initiated["payment"]["status"], "completed");
    assert!(initiated.get("client_secret").is_none());

    let response = deliver_square(&app, &square_payment_created(&app, "sq_pay_2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "duplicate");
    assert_eq!(owner_payments(&app).await["meta"]["pagination"]["total"], 1);
}

#[tokio::test]
async fn payments_that_cannot_be_initiated_are_rejected() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "amount": "10.00", "payment_method": "bank_transfer" })),
            Some(app.owner_token()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "amount": "0", "payment_method": "stripe" })),
            Some(app.owner_token()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(owner_payments(&app).await["meta"]["pagination"]["total"], 0);
}
