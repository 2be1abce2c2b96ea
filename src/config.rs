use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_SWEEP_BATCH_LIMIT: u64 = 25;
const DEFAULT_SWEEP_ITEM_DELAY_MS: u64 = 500;
const DEFAULT_NALOGO_TIMEOUT_SECS: u64 = 30;

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

    /// Token required on operator/admin endpoints (x-admin-token header)
    #[serde(default)]
    pub admin_api_token: Option<String>,

    /// Additional reverse-proxy CIDRs trusted when unwinding X-Forwarded-For,
    /// comma-separated (e.g. "10.1.0.0/16,172.30.0.0/12")
    #[serde(default)]
    pub trusted_proxy_cidrs: Option<String>,

    /// Extra subnets accepted as YooKassa notification sources, on top of the
    /// published ranges; comma-separated
    #[serde(default)]
    pub yookassa_extra_subnets: Option<String>,

    /// CryptoBot API token; webhook signatures are HMAC-SHA256 keyed with its hash
    #[serde(default)]
    pub cryptobot_token: Option<String>,

    /// MulenPay shared secret for ordered-field digest verification
    #[serde(default)]
    pub mulenpay_secret: Option<String>,

    /// Tax receipt filing feature switch
    #[serde(default)]
    pub nalogo_enabled: bool,

    /// Self-employed taxpayer INN
    #[serde(default)]
    pub nalogo_inn: Option<String>,

    /// lknpd.nalog.ru password
    #[serde(default)]
    pub nalogo_password: Option<String>,

    /// Optional SOCKS5 proxy for tax-service egress, "host:port" with optional
    /// "user:pass@" prefix
    #[serde(default)]
    pub nalogo_proxy: Option<String>,

    /// Per-call timeout for the tax service (seconds)
    #[serde(default = "default_nalogo_timeout_secs")]
    #[validate(range(min = 3, max = 120))]
    pub nalogo_timeout_secs: u64,

    /// Receipt sweep interval (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub receipt_sweep_interval_secs: u64,

    /// Max rows handled per sweep tick
    #[serde(default = "default_sweep_batch_limit")]
    pub receipt_sweep_batch_limit: u64,

    /// Pause between items within a sweep batch (milliseconds)
    #[serde(default = "default_sweep_item_delay_ms")]
    pub receipt_sweep_item_delay_ms: u64,

    /// Entitlement backend base URL
    #[serde(default)]
    pub entitlement_base_url: Option<String>,

    /// Entitlement backend bearer token
    #[serde(default)]
    pub entitlement_api_token: Option<String>,

    /// Referral ledger base URL
    #[serde(default)]
    pub referral_base_url: Option<String>,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

impl AppConfig {
    /// Minimal constructor used by the test harness.
    pub fn new(
        database_url: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            admin_api_token: None,
            trusted_proxy_cidrs: None,
            yookassa_extra_subnets: None,
            cryptobot_token: None,
            mulenpay_secret: None,
            nalogo_enabled: false,
            nalogo_inn: None,
            nalogo_password: None,
            nalogo_proxy: None,
            nalogo_timeout_secs: default_nalogo_timeout_secs(),
            receipt_sweep_interval_secs: default_sweep_interval_secs(),
            receipt_sweep_batch_limit: default_sweep_batch_limit(),
            receipt_sweep_item_delay_ms: default_sweep_item_delay_ms(),
            entitlement_base_url: None,
            entitlement_api_token: None,
            referral_base_url: None,
            cors_allowed_origins: None,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Split a comma-separated config value into trimmed, non-empty entries.
    pub fn split_list(raw: Option<&str>) -> Vec<String> {
        raw.map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

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
fn default_nalogo_timeout_secs() -> u64 {
    DEFAULT_NALOGO_TIMEOUT_SECS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_sweep_batch_limit() -> u64 {
    DEFAULT_SWEEP_BATCH_LIMIT
}
fn default_sweep_item_delay_ms() -> u64 {
    DEFAULT_SWEEP_ITEM_DELAY_MS
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

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("paygate_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
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
        .set_default("database_url", "sqlite://paygate.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
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

    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_trims_and_drops_empty_entries() {
        let parsed = AppConfig::split_list(Some(" 10.0.0.0/8 , , 192.168.0.0/16"));
        assert_eq!(parsed, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert!(AppConfig::split_list(None).is_empty());
    }

    #[test]
    fn log_level_validation_rejects_unknown_levels() {
        assert!(validate_log_level("debug").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
