use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_RESERVATION_TTL_SECS: u64 = 15 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_CHECKOUT_TTL_SECS: u64 = 60 * 60;
const DEFAULT_CART_TTL_SECS: u64 = 30 * 24 * 60 * 60; // 30 days
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PAYMENT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 2;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEV_WEBHOOK_SECRET: &str = "whsec_development_only";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment name (development, staging, production)
    pub environment: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// ISO currency for new carts
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// How long a stock hold lives before the sweep releases it
    #[serde(default = "default_reservation_ttl_secs")]
    #[validate(custom = "validate_ttl")]
    pub reservation_ttl_secs: u64,

    /// How often the reservation and session sweeps run
    #[serde(default = "default_sweep_interval_secs")]
    #[validate(custom = "validate_ttl")]
    pub reservation_sweep_interval_secs: u64,

    /// Idle time after which a checkout session is considered abandoned
    #[serde(default = "default_checkout_ttl_secs")]
    #[validate(custom = "validate_ttl")]
    pub checkout_session_ttl_secs: u64,

    /// Idle time after which a cart is deleted by the sweep
    #[serde(default = "default_cart_ttl_secs")]
    #[validate(custom = "validate_ttl")]
    pub cart_ttl_secs: u64,

    /// Payment provider ("mock" or "rest")
    #[serde(default = "default_payment_provider")]
    #[validate(custom = "validate_payment_provider")]
    pub payment_provider: String,

    /// Base URL of the REST payment gateway
    #[serde(default)]
    pub payment_gateway_url: Option<String>,

    /// API key for the REST payment gateway
    #[serde(default)]
    pub payment_api_key: Option<String>,

    /// Secret for verifying payment webhook signatures
    #[serde(default = "default_webhook_secret")]
    #[validate(length(min = 8))]
    pub payment_webhook_secret: String,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Deadline for a single provider call
    #[serde(default = "default_payment_timeout_secs")]
    #[validate(custom = "validate_ttl")]
    pub payment_timeout_secs: u64,

    /// Attempts per provider call (same idempotency key) before reconciling
    #[serde(default = "default_payment_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub payment_max_attempts: u32,

    /// Deadline for catalog, tax and shipping lookups
    #[serde(default = "default_lookup_timeout_secs")]
    #[validate(custom = "validate_ttl")]
    pub lookup_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Prefix of human-readable order numbers
    #[serde(default = "default_order_number_prefix")]
    #[validate(length(min = 1, max = 12))]
    pub order_number_prefix: String,

    /// JSON file with products, discounts, tax zones and shipping methods
    #[serde(default)]
    pub catalog_seed_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment: DEFAULT_ENV.to_string(),
            log_level: default_log_level(),
            log_json: false,
            default_currency: default_currency(),
            reservation_ttl_secs: DEFAULT_RESERVATION_TTL_SECS,
            reservation_sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            checkout_session_ttl_secs: DEFAULT_CHECKOUT_TTL_SECS,
            cart_ttl_secs: DEFAULT_CART_TTL_SECS,
            payment_provider: default_payment_provider(),
            payment_gateway_url: None,
            payment_api_key: None,
            payment_webhook_secret: default_webhook_secret(),
            payment_webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            payment_timeout_secs: DEFAULT_PAYMENT_TIMEOUT_SECS,
            payment_max_attempts: DEFAULT_PAYMENT_MAX_ATTEMPTS,
            lookup_timeout_secs: DEFAULT_LOOKUP_TIMEOUT_SECS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            order_number_prefix: default_order_number_prefix(),
            catalog_seed_path: None,
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reservation_sweep_interval_secs)
    }

    pub fn checkout_session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.checkout_session_ttl_secs as i64)
    }

    pub fn cart_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cart_ttl_secs as i64)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    /// Cross-field checks the derive cannot express.
    fn validate_additional_constraints(&self) -> Result<(), ValidationError> {
        if self.payment_provider.eq_ignore_ascii_case("rest")
            && self
                .payment_gateway_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            let mut err = ValidationError::new("payment_gateway_url");
            err.message = Some("payment_gateway_url is required for the rest provider".into());
            return Err(err);
        }
        if self.is_production() && self.payment_webhook_secret == DEV_WEBHOOK_SECRET {
            let mut err = ValidationError::new("payment_webhook_secret");
            err.message = Some("payment_webhook_secret must be overridden in production".into());
            return Err(err);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ConfigError),
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Invalid configuration: {0:?}")]
    Constraint(ValidationError),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_reservation_ttl_secs() -> u64 {
    DEFAULT_RESERVATION_TTL_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_checkout_ttl_secs() -> u64 {
    DEFAULT_CHECKOUT_TTL_SECS
}

fn default_cart_ttl_secs() -> u64 {
    DEFAULT_CART_TTL_SECS
}

fn default_payment_provider() -> String {
    "mock".to_string()
}

fn default_webhook_secret() -> String {
    DEV_WEBHOOK_SECRET.to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_payment_timeout_secs() -> u64 {
    DEFAULT_PAYMENT_TIMEOUT_SECS
}

fn default_payment_max_attempts() -> u32 {
    DEFAULT_PAYMENT_MAX_ATTEMPTS
}

fn default_lookup_timeout_secs() -> u64 {
    DEFAULT_LOOKUP_TIMEOUT_SECS
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_order_number_prefix() -> String {
    "ORD".to_string()
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

fn validate_payment_provider(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "mock" | "rest" => Ok(()),
        _ => {
            let mut err = ValidationError::new("payment_provider");
            err.message = Some("Must be one of: mock, rest".into());
            Err(err)
        }
    }
}

fn validate_ttl(secs: u64) -> Result<(), ValidationError> {
    if secs == 0 {
        let mut err = ValidationError::new("ttl");
        err.message = Some("durations must be greater than 0 seconds".into());
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
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("commerce_core={},tower_http=debug", level);
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

/// Built-in defaults, the bottom layer of every configuration.
fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)
}

fn finish(config: Config) -> Result<AppConfig, AppConfigError> {
    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint failed: {:?}", e);
        AppConfigError::Constraint(e)
    })?;

    Ok(app_config)
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

    let config = builder_with_defaults()?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config = finish(config)?;
    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn load_from_toml(content: &str) -> Result<AppConfig, AppConfigError> {
        let config = builder_with_defaults()?
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;
        finish(config)
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_additional_constraints().is_ok());
        assert_eq!(config.reservation_ttl(), chrono::Duration::minutes(15));
    }

    #[test]
    fn file_values_override_defaults() {
        let config = load_from_toml(
            r#"
            port = 9090
            reservation_ttl_secs = 120
            order_number_prefix = "SHOP"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.reservation_ttl_secs, 120);
        assert_eq!(config.order_number_prefix, "SHOP");
        assert_eq!(config.payment_provider, "mock");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = load_from_toml(r#"payment_provider = "carrier-pigeon""#);
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }

    #[test]
    fn rest_provider_needs_a_url() {
        let result = load_from_toml(r#"payment_provider = "rest""#);
        assert!(matches!(result, Err(AppConfigError::Constraint(_))));

        let config = load_from_toml(
            r#"
            payment_provider = "rest"
            payment_gateway_url = "https://gateway.example"
            "#,
        )
        .unwrap();
        assert_eq!(config.payment_provider, "rest");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let result = load_from_toml("reservation_ttl_secs = 0");
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }
}
