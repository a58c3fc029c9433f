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
const DEFAULT_DELIVERY_FEE: f64 = 150.0;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
const MPESA_SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const MPESA_PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// M-Pesa (Daraja) gateway configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MpesaConfig {
    /// Daraja consumer key (Basic auth username for the OAuth endpoint)
    #[serde(default)]
    pub consumer_key: String,

    /// Daraja consumer secret
    #[serde(default)]
    pub consumer_secret: String,

    /// Paybill / till shortcode
    #[serde(default)]
    pub shortcode: String,

    /// Lipa na M-Pesa online passkey
    #[serde(default)]
    pub passkey: String,

    /// Publicly reachable URL the provider posts the STK callback to
    #[serde(default)]
    pub callback_url: String,

    /// Provider API base URL; overridable for tests
    #[serde(default = "default_mpesa_base_url")]
    pub api_base_url: String,

    /// Provider environment: "sandbox" or "production"
    #[serde(default = "default_mpesa_environment")]
    #[validate(custom = "validate_mpesa_environment")]
    pub environment: String,

    /// Outbound HTTP timeout (seconds) for token and push requests
    #[serde(default = "default_mpesa_timeout_secs")]
    pub timeout_secs: u64,

    /// Token fetch attempts before giving up
    #[serde(default = "default_token_retry_attempts")]
    pub token_retry_attempts: u32,

    /// Base delay (milliseconds) for exponential token-retry backoff
    #[serde(default = "default_token_retry_base_delay_ms")]
    pub token_retry_base_delay_ms: u64,

    /// Sandbox-only escape hatch: mark a push "initiated (simulated)" when
    /// the token fetch fails. Rejected outright in production.
    #[serde(default)]
    pub allow_simulated_push: bool,
}

impl MpesaConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            callback_url: String::new(),
            api_base_url: default_mpesa_base_url(),
            environment: default_mpesa_environment(),
            timeout_secs: default_mpesa_timeout_secs(),
            token_retry_attempts: default_token_retry_attempts(),
            token_retry_base_delay_ms: default_token_retry_base_delay_ms(),
            allow_simulated_push: false,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

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

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

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

    /// Delivery fee applied to new orders (KES). Stored on each order at
    /// creation time; checkout only chooses between this stored value and
    /// zero for pharmacy pickup.
    #[serde(default = "default_delivery_fee")]
    pub default_delivery_fee: f64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// M-Pesa gateway configuration
    #[serde(default)]
    #[validate]
    pub mpesa: MpesaConfig,
}

impl AppConfig {
    /// Creates a new configuration (primarily for tests and embedding)
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            default_delivery_fee: default_delivery_fee(),
            event_channel_capacity: default_event_channel_capacity(),
            mpesa: MpesaConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
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

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.default_delivery_fee.is_finite() || self.default_delivery_fee < 0.0 {
            let mut err = ValidationError::new("delivery_fee");
            err.message = Some("Delivery fee must be a finite, non-negative amount".into());
            errors.add("default_delivery_fee", err);
        }

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        // The simulated-push fallback must be unreachable in production.
        if self.mpesa.is_production() && self.mpesa.allow_simulated_push {
            let mut err = ValidationError::new("simulated_push_in_production");
            err.message = Some(
                "mpesa.allow_simulated_push cannot be enabled when mpesa.environment is production"
                    .into(),
            );
            errors.add("mpesa", err);
        }

        if self.is_production() && !self.mpesa.is_production() {
            let mut err = ValidationError::new("mpesa_sandbox_in_production");
            err.message =
                Some("production deployments must use the production M-Pesa environment".into());
            errors.add("mpesa", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
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

fn default_delivery_fee() -> f64 {
    DEFAULT_DELIVERY_FEE
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_mpesa_base_url() -> String {
    MPESA_SANDBOX_BASE_URL.to_string()
}

fn default_mpesa_environment() -> String {
    "sandbox".to_string()
}

fn default_mpesa_timeout_secs() -> u64 {
    30
}

fn default_token_retry_attempts() -> u32 {
    3
}

fn default_token_retry_base_delay_ms() -> u64 {
    250
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

fn validate_mpesa_environment(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "sandbox" | "production" => Ok(()),
        _ => {
            let mut err = ValidationError::new("mpesa_environment");
            err.message = Some("Must be one of: sandbox, production".into());
            Err(err)
        }
    }
}

/// Returns the provider base URL matching an M-Pesa environment name.
pub fn mpesa_base_url_for(environment: &str) -> &'static str {
    if environment.eq_ignore_ascii_case("production") {
        MPESA_PRODUCTION_BASE_URL
    } else {
        MPESA_SANDBOX_BASE_URL
    }
}

/// Initializes the tracing subscriber.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let filter_directive =
        env::var("RUST_LOG").unwrap_or_else(|_| format!("{level},sqlx=warn,hyper=warn"));

    if json {
        let _ = fmt()
            .with_env_filter(filter_directive)
            .json()
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
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

    let config = Config::builder()
        .set_default("database_url", "sqlite://pharmacy.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

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
