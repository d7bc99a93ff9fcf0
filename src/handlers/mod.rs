pub mod common;
pub mod notifications;
pub mod payment_webhooks;
pub mod payments;
pub mod quotes;

use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::integrations::{
    self, FilePdfRenderer, HttpMailer, LogMailer, Mailer, OpenAiAnalyzer, PaymentProvider,
    ProjectAnalyzer, QuoteRenderer, SquareProvider, StripeProvider,
};
use crate::services::estimates::{EstimateCalculator, EstimateCatalog};
use crate::services::notifications::NotificationService;
use crate::services::payment_reconciler::PaymentReconciler;
use crate::services::payments::PaymentService;
use crate::services::quotes::{QuoteService, QuoteSettings};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

const DEFAULT_AI_API_URL: &str = "https://api.openai.com/v1";

/// Outbound collaborators shared by the services. Tests swap in mocks.
#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Arc<dyn Mailer>,
    pub renderer: Arc<dyn QuoteRenderer>,
    pub analyzer: Option<Arc<dyn ProjectAnalyzer>>,
    pub stripe: Arc<dyn PaymentProvider>,
    pub square: Arc<dyn PaymentProvider>,
    pub catalog: Arc<EstimateCatalog>,
}

impl Collaborators {
    /// Vendor clients built from configuration.
    ///
    /// Without an email endpoint, mail is only logged. Without an AI key,
    /// estimates skip project analysis.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let client = integrations::http_client(cfg.http_client_timeout_secs)?;

        let mailer: Arc<dyn Mailer> = match (&cfg.email_api_url, &cfg.email_api_key) {
            (Some(url), Some(key)) => Arc::new(HttpMailer::new(
                client.clone(),
                url.clone(),
                key.clone(),
                cfg.email_from.clone(),
            )),
            _ => {
                info!("email API not configured; outgoing mail will be logged only");
                Arc::new(LogMailer)
            }
        };

        let analyzer = cfg.ai_api_key.as_ref().map(|key| {
            let base_url = cfg.ai_api_url.as_deref().unwrap_or(DEFAULT_AI_API_URL);
            Arc::new(OpenAiAnalyzer::new(
                client.clone(),
                base_url,
                key.clone(),
                cfg.ai_model.clone(),
            )) as Arc<dyn ProjectAnalyzer>
        });

        let catalog = match &cfg.estimate_catalog_path {
            Some(path) => {
                info!(path = %path, "loading estimate catalog");
                EstimateCatalog::from_file(path)?
            }
            None => EstimateCatalog::default(),
        };
        catalog.check()?;

        Ok(Self {
            mailer,
            renderer: Arc::new(FilePdfRenderer::new(&cfg.upload_dir)),
            analyzer,
            stripe: Arc::new(StripeProvider::new(cfg.into(), client.clone())),
            square: Arc::new(SquareProvider::new(cfg.into(), client)),
            catalog: Arc::new(catalog),
        })
    }
}

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub quotes: Arc<QuoteService>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<PaymentReconciler>,
    pub notifications: Arc<NotificationService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        cfg: &AppConfig,
        collaborators: Collaborators,
    ) -> Self {
        let calculator = Arc::new(EstimateCalculator::new(
            collaborators.catalog,
            collaborators.analyzer,
        ));

        let quotes = Arc::new(QuoteService::new(
            db_pool.clone(),
            event_sender.clone(),
            calculator,
            collaborators.renderer,
            collaborators.mailer.clone(),
            QuoteSettings::from(cfg),
        ));
        let payments = Arc::new(PaymentService::new(
            db_pool.clone(),
            event_sender.clone(),
            collaborators.mailer.clone(),
            collaborators.stripe.clone(),
            collaborators.square.clone(),
            cfg.default_currency.clone(),
        ));
        let reconciler = Arc::new(PaymentReconciler::new(
            db_pool.clone(),
            event_sender,
            collaborators.mailer,
            collaborators.stripe,
            collaborators.square,
        ));
        let notifications = Arc::new(NotificationService::new(db_pool));

        Self {
            quotes,
            payments,
            reconciler,
            notifications,
        }
    }
}
