use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use uuid::Uuid;
use vaif_api::{
    app_router,
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    config::AppConfig,
    db::{self, DbConfig},
    errors::ServiceError,
    events,
    handlers::{AppServices, Collaborators},
    integrations::{
        self, EmailMessage, FilePdfRenderer, Mailer, SquareProvider, StripeProvider,
    },
    services::estimates::EstimateCatalog,
    AppState,
};
use wiremock::MockServer;

pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test";
pub const SQUARE_SIGNATURE_KEY: &str = "sq_sig_key";
pub const OWNER_EMAIL: &str = "owner@vaif.tech";

/// Keeps every outgoing email for later assertions.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn sent_to(&self, address: &str) -> Vec<EmailMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.to == address)
            .collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), ServiceError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Helper harness for spinning up the full router over an in-memory SQLite
/// database, with both processors pointed at a local mock server.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub mailer: Arc<RecordingMailer>,
    pub vendor: MockServer,
    pub owner_id: Uuid,
    owner_token: String,
    other_token: String,
    admin_token: String,
    _uploads: TempDir,
    _event_task: tokio::task::JoinHandle<u64>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let vendor = MockServer::start().await;
        let uploads = tempfile::tempdir().expect("create upload dir");

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "integration_test_secret_key_that_is_comfortably_longer_than_sixty_four_chars".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        cfg.upload_dir = uploads.path().to_string_lossy().into_owned();
        cfg.stripe_secret_key = Some("sk_test_123".to_string());
        cfg.stripe_webhook_secret = Some(STRIPE_WEBHOOK_SECRET.to_string());
        cfg.stripe_api_base_url = vendor.uri();
        cfg.square_access_token = Some("sq_access_123".to_string());
        cfg.square_location_id = Some("LOC1".to_string());
        cfg.square_webhook_signature_key = Some(SQUARE_SIGNATURE_KEY.to_string());
        cfg.square_api_base_url = vendor.uri();

        let pool = db::establish_connection_with_config(&DbConfig::sqlite_memory())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_sender, event_rx) = events::channel(256);
        let event_sender = Arc::new(event_sender);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let client = integrations::http_client(5).expect("http client");
        let mailer = Arc::new(RecordingMailer::default());
        let collaborators = Collaborators {
            mailer: mailer.clone(),
            renderer: Arc::new(FilePdfRenderer::new(uploads.path())),
            analyzer: None,
            stripe: Arc::new(StripeProvider::new((&cfg).into(), client.clone())),
            square: Arc::new(SquareProvider::new((&cfg).into(), client)),
            catalog: Arc::new(EstimateCatalog::default()),
        };
        let services = AppServices::new(db_arc.clone(), event_sender.clone(), &cfg, collaborators);

        let auth = Arc::new(AuthService::new(AuthConfig::from(&cfg)));
        let owner_id = Uuid::new_v4();
        let owner_token = auth
            .issue_token(owner_id, Some(OWNER_EMAIL.to_string()), Vec::new())
            .expect("owner token");
        let other_token = auth
            .issue_token(Uuid::new_v4(), Some("someone@else.dev".to_string()), Vec::new())
            .expect("other token");
        let admin_token = auth
            .issue_token(
                Uuid::new_v4(),
                Some("admin@vaif.tech".to_string()),
                vec![ADMIN_ROLE.to_string()],
            )
            .expect("admin token");

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            event_sender,
            services,
            auth,
            started_at: Utc::now(),
        };
        let router = app_router(state.clone(), CorsLayer::permissive());

        Self {
            router,
            state,
            mailer,
            vendor,
            owner_id,
            owner_token,
            other_token,
            admin_token,
            _uploads: uploads,
            _event_task: event_task,
        }
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    #[allow(dead_code)]
    pub fn other_token(&self) -> &str {
        &self.other_token
    }

    #[allow(dead_code)]
    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.oneshot(request).await
    }

    /// Raw POST with extra headers, for signed webhook deliveries.
    #[allow(dead_code)]
    pub async fn post_raw(&self, uri: &str, payload: Vec<u8>, headers: &[(&str, &str)]) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Body::from(payload))
            .expect("failed to build request");
        self.oneshot(request).await
    }

    async fn oneshot(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Reads a response body as JSON.
pub async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is JSON")
}
