use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_QUOTE_VALIDITY_DAYS: i64 = 30;
const DEFAULT_STRIPE_TOLERANCE_SECS: u64 = 300;
const DEV_DEFAULT_JWT_SECRET: &str =
    "this_is_a_development_secret_key_that_is_at_least_64_characters_long_for_testing";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key (minimum 64 characters)
    #[validate(length(min = 64), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// JWT expiration time in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration: usize,

    /// JWT issuer name
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    /// JWT audience
    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Export spans over OTLP; also enabled by `OTEL_EXPORTER_OTLP_ENDPOINT`
    #[serde(default)]
    pub otel_enabled: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// CORS: allow credentials
    #[serde(default)]
    pub cors_allow_credentials: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    // ========== Quotes ==========
    /// Days between issue date and the default `valid_until`
    #[serde(default = "default_quote_validity_days")]
    #[validate(range(min = 1, max = 365))]
    pub quote_validity_days: i64,

    /// Tax rate applied when a quote request does not carry one (0.08 = 8%)
    #[serde(default)]
    #[validate(custom = "validate_tax_rate")]
    pub quote_default_tax_rate: f64,

    /// Currency code used when a request omits it
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Directory served under `/uploads`
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Public origin used in client-facing links (view/accept pages)
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Seconds between expiry sweeps, 0 disables the background sweep
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,

    /// Optional JSON file replacing the built-in estimate catalog
    #[serde(default)]
    pub estimate_catalog_path: Option<String>,

    // ========== Payments ==========
    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    /// Signing secret for `stripe-signature` verification
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,

    /// Accepted clock skew for Stripe signature timestamps
    #[serde(default = "default_stripe_tolerance_secs")]
    pub stripe_webhook_tolerance_secs: u64,

    #[serde(default = "default_stripe_api_base_url")]
    pub stripe_api_base_url: String,

    #[serde(default)]
    pub square_access_token: Option<String>,

    #[serde(default)]
    pub square_location_id: Option<String>,

    /// Signature key for `x-square-signature` verification
    #[serde(default)]
    pub square_webhook_signature_key: Option<String>,

    #[serde(default = "default_square_api_base_url")]
    pub square_api_base_url: String,

    // ========== Outbound collaborators ==========
    /// Transactional email endpoint; emails are only logged when unset
    #[serde(default)]
    pub email_api_url: Option<String>,

    #[serde(default)]
    pub email_api_key: Option<String>,

    #[serde(default = "default_email_from")]
    pub email_from: String,

    /// OpenAI-compatible chat completions endpoint for project analysis
    #[serde(default)]
    pub ai_api_url: Option<String>,

    #[serde(default)]
    pub ai_api_key: Option<String>,

    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// Timeout applied to every outbound HTTP call
    #[serde(default = "default_http_client_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub http_client_timeout_secs: u64,
}

impl AppConfig {
    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            jwt_expiration: default_jwt_expiration(),
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            otel_enabled: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            cors_allow_credentials: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            quote_validity_days: default_quote_validity_days(),
            quote_default_tax_rate: 0.0,
            default_currency: default_currency(),
            upload_dir: default_upload_dir(),
            public_base_url: default_public_base_url(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
            estimate_catalog_path: None,
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_webhook_tolerance_secs: default_stripe_tolerance_secs(),
            stripe_api_base_url: default_stripe_api_base_url(),
            square_access_token: None,
            square_location_id: None,
            square_webhook_signature_key: None,
            square_api_base_url: default_square_api_base_url(),
            email_api_url: None,
            email_api_key: None,
            email_from: default_email_from(),
            ai_api_url: None,
            ai_api_key: None,
            ai_model: default_ai_model(),
            http_client_timeout_secs: default_http_client_timeout_secs(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Default tax rate as a decimal, clamped to four places
    pub fn default_tax_rate(&self) -> rust_decimal::Decimal {
        rust_decimal::Decimal::try_from(self.quote_default_tax_rate)
            .unwrap_or_default()
            .round_dp(4)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET to a unique, secure value."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.is_production() {
            if is_blank(&self.stripe_webhook_secret) {
                let mut err = ValidationError::new("stripe_webhook_secret_required");
                err.message =
                    Some("APP__STRIPE_WEBHOOK_SECRET is required in production".into());
                errors.add("stripe_webhook_secret", err);
            }
            if is_blank(&self.square_webhook_signature_key) {
                let mut err = ValidationError::new("square_webhook_signature_key_required");
                err.message =
                    Some("APP__SQUARE_WEBHOOK_SIGNATURE_KEY is required in production".into());
                errors.add("square_webhook_signature_key", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_jwt_expiration() -> usize {
    3600
}

fn default_auth_issuer() -> String {
    "vaif-api".to_string()
}

fn default_auth_audience() -> String {
    "vaif-auth".to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_true_bool() -> bool {
    true
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_quote_validity_days() -> i64 {
    DEFAULT_QUOTE_VALIDITY_DAYS
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_expiry_sweep_interval_secs() -> u64 {
    3600
}

fn default_stripe_tolerance_secs() -> u64 {
    DEFAULT_STRIPE_TOLERANCE_SECS
}

fn default_stripe_api_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_square_api_base_url() -> String {
    "https://connect.squareup.com".to_string()
}

fn default_email_from() -> String {
    "VAIF TECH <no-reply@vaif.tech>".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_http_client_timeout_secs() -> u64 {
    15
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if trimmed.len() < 64 {
        let mut err = ValidationError::new("jwt_secret");
        err.message =
            Some("JWT secret must be at least 64 characters for adequate security".into());
        return Err(err);
    }

    // Reject known insecure defaults and obvious placeholders
    const DISALLOWED: [&str; 3] = [
        "CHANGE_THIS_SECRET_IN_PRODUCTION",
        "your-secret-key",
        "default-secret-key",
    ];
    if DISALLOWED
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be overridden with a secure random value".into());
        return Err(err);
    }

    let unique_chars: std::collections::HashSet<char> = trimmed.chars().collect();
    if unique_chars.len() < 10 {
        let mut err = ValidationError::new("jwt_secret");
        err.message =
            Some("JWT secret must have at least 10 unique characters for adequate entropy".into());
        return Err(err);
    }

    Ok(())
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || rate < 0.0 || rate > 1.0 {
        let mut err = ValidationError::new("quote_default_tax_rate");
        err.message =
            Some("quote_default_tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool, otel: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("vaif_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let otel_enabled = otel || env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::{trace as sdktrace, Resource};

        let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4317".to_string());
        let service_name =
            env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "vaif-api".to_string());

        let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);
        let tracer = match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(sdktrace::config().with_resource(resource))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(tracer) => tracer,
            Err(err) => {
                error!("Failed to install OTLP pipeline: {}", err);
                if json {
                    let _ = fmt().with_env_filter(filter_directive).json().try_init();
                } else {
                    let _ = fmt().with_env_filter(filter_directive).try_init();
                }
                return;
            }
        };

        let base = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(EnvFilter::new(filter_directive));

        if json {
            let _ = base.with(fmt::layer().json()).try_init();
        } else {
            let _ = base.with(fmt::layer()).try_init();
        }
    } else if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret has no default and must come from a file or APP__JWT_SECRET
    let config = Config::builder()
        .set_default("database_url", "sqlite://vaif.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET environment variable with a secure random string (minimum 64 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod cors_validation_tests {
    use super::*;

    fn base_config() -> AppConfig {
        let mut cfg = AppConfig::new(
            "sqlite://vaif.db?mode=memory".into(),
            "super_secure_jwt_secret_that_is_long_enough_123".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        );
        cfg.stripe_webhook_secret = Some("whsec_test".into());
        cfg.square_webhook_signature_key = Some("sq_key".into());
        cfg
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn non_dev_allows_override_flag() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn non_dev_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_allows_permissive_by_default() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_requires_webhook_secrets() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        cfg.square_webhook_signature_key = Some("  ".into());
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors
            .field_errors()
            .contains_key("square_webhook_signature_key"));
        assert!(!errors.field_errors().contains_key("stripe_webhook_secret"));
    }

    #[test]
    fn default_tax_rate_converts_to_decimal() {
        let mut cfg = base_config();
        cfg.quote_default_tax_rate = 0.0825;
        assert_eq!(cfg.default_tax_rate().to_string(), "0.0825");
    }
}
