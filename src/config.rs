use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
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
const DEFAULT_SHOP_TAX_RATE: f64 = 0.08;
const DEFAULT_COURSE_SESSION_TAX: i64 = 10_000;
const DEFAULT_SHIPPING_FLAT_RATE: i64 = 30_000;
const DEFAULT_REFERENCE_PREFIX: &str = "ACD-";
const DEFAULT_REFERENCE_ATTEMPTS: u32 = 5;
const DEFAULT_MIN_PAYABLE_AMOUNT: i64 = 1_000;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;

/// Checkout pricing and redirect settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// Tax applied to shop orders, as a fraction of the discounted subtotal
    #[serde(default = "default_shop_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub shop_tax_rate: f64,

    /// Flat tax applied to every course-session checkout
    #[serde(default = "default_course_session_tax")]
    #[validate(range(min = 0))]
    pub course_session_tax: i64,

    /// Flat shipping charged when a cart holds at least one physical product
    #[serde(default = "default_shipping_flat_rate")]
    #[validate(range(min = 0))]
    pub shipping_flat_rate: i64,

    /// Prefix of the external order reference
    #[serde(default = "default_reference_prefix")]
    #[validate(length(min = 1, max = 8))]
    pub reference_prefix: String,

    /// How many fresh references to try before giving up on a collision
    #[serde(default = "default_reference_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub reference_attempts: u32,

    /// Smallest amount the gateway accepts
    #[serde(default = "default_min_payable_amount")]
    #[validate(range(min = 1))]
    pub min_payable_amount: i64,

    /// Public base URL the gateway redirects the payer back to
    #[serde(default = "default_callback_base_url")]
    #[validate(url)]
    pub callback_base_url: String,

    /// Client page that renders the payment outcome
    #[serde(default = "default_client_checkout_url")]
    #[validate(url)]
    pub client_checkout_url: String,
}

impl CheckoutConfig {
    pub fn shop_tax_rate_decimal(&self) -> Decimal {
        self.shop_tax_rate
            .to_string()
            .parse::<Decimal>()
            .unwrap_or_default()
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            shop_tax_rate: default_shop_tax_rate(),
            course_session_tax: default_course_session_tax(),
            shipping_flat_rate: default_shipping_flat_rate(),
            reference_prefix: default_reference_prefix(),
            reference_attempts: default_reference_attempts(),
            min_payable_amount: default_min_payable_amount(),
            callback_base_url: default_callback_base_url(),
            client_checkout_url: default_client_checkout_url(),
        }
    }
}

/// Payment gateway connection settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[validate(url)]
    pub base_url: String,

    /// Page the payer is sent to, with the authority appended
    #[validate(url)]
    pub start_pay_url: String,

    #[validate(length(min = 1))]
    pub merchant_id: String,

    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,

    #[serde(default = "default_gateway_description")]
    pub description: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://payment.zarinpal.com".to_string(),
            start_pay_url: "https://payment.zarinpal.com/pg/StartPay".to_string(),
            merchant_id: "00000000-0000-0000-0000-000000000000".to_string(),
            timeout_secs: default_gateway_timeout_secs(),
            description: default_gateway_description(),
        }
    }
}

/// SMS provider settings
#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SmsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// JWT expiration time in seconds
    #[validate(range(min = 60, max = 86400))]
    pub jwt_expiration: u64,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to create missing tables on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Root directory for private course media
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    #[serde(default)]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub sms: SmsConfig,
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading error: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationErrors),
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            jwt_expiration: 3600,
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            media_dir: default_media_dir(),
            checkout: CheckoutConfig::default(),
            gateway: GatewayConfig::default(),
            sms: SmsConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Nested sections and cross-field rules
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        self.checkout.validate()?;
        self.gateway.validate()?;
        self.sms.validate()?;

        let mut errors = ValidationErrors::new();
        if self.sms.enabled && (self.sms.api_url.is_none() || self.sms.api_key.is_none()) {
            let mut err = ValidationError::new("sms");
            err.message = Some("sms.api_url and sms.api_key are required when sms is enabled".into());
            errors.add("sms", err);
        }
        if self.is_production() && self.gateway.merchant_id.chars().all(|c| c == '0' || c == '-') {
            let mut err = ValidationError::new("gateway");
            err.message = Some("gateway.merchant_id must be configured in production".into());
            errors.add("gateway", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_media_dir() -> String {
    "media".to_string()
}

fn default_shop_tax_rate() -> f64 {
    DEFAULT_SHOP_TAX_RATE
}

fn default_course_session_tax() -> i64 {
    DEFAULT_COURSE_SESSION_TAX
}

fn default_shipping_flat_rate() -> i64 {
    DEFAULT_SHIPPING_FLAT_RATE
}

fn default_reference_prefix() -> String {
    DEFAULT_REFERENCE_PREFIX.to_string()
}

fn default_reference_attempts() -> u32 {
    DEFAULT_REFERENCE_ATTEMPTS
}

fn default_min_payable_amount() -> i64 {
    DEFAULT_MIN_PAYABLE_AMOUNT
}

fn default_callback_base_url() -> String {
    "http://localhost:8080/api/v1/checkout/callback".to_string()
}

fn default_client_checkout_url() -> String {
    "http://localhost:3000/checkout/result".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_gateway_description() -> String {
    "Academy order payment".to_string()
}

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

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        let mut err = ValidationError::new("shop_tax_rate");
        err.message = Some("shop_tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("academy_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
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
        .set_default("database_url", "sqlite://academy.db?mode=rwc")?
        .set_default("jwt_expiration", 3600)?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (minimum 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
