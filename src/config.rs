use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub market: MarketConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Build the configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            market: MarketConfig::from_env(),
            storage: StorageConfig::from_env(),
            sync: SyncConfig::from_env(),
            log: LogConfig::from_env(),
        }
    }
}

/// Exchange REST API connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Base URL that relative request paths are resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Outbound proxy (e.g., "socks5h://127.0.0.1:1080"), None for direct connections
    #[serde(default = "default_proxy_url")]
    pub proxy_url: Option<String>,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            proxy_url: default_proxy_url(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl MarketConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("HUOBI_BASE_URL").unwrap_or(defaults.base_url),
            proxy_url: match std::env::var("HUOBI_PROXY_URL") {
                Ok(value) => parse_proxy_url(&value),
                Err(_) => defaults.proxy_url,
            },
            request_timeout_secs: env_or("HTTP_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            connect_timeout_secs: env_or("HTTP_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            user_agent: defaults.user_agent,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// A named document-store connection string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedConnection {
    pub name: String,
    pub url: String,
}

/// Document-store connections, in declaration order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub connections: Vec<NamedConnection>,

    /// Maximum pooled connections per PostgreSQL connection
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            pool_size: default_pool_size(),
        }
    }
}

impl StorageConfig {
    /// Reads `STORAGE_CONNECTIONS` ("name=url,name=url"), or `DATABASE_URL` as a
    /// single connection named "default"
    pub fn from_env() -> Self {
        let connections = match std::env::var("STORAGE_CONNECTIONS") {
            Ok(spec) => parse_connections(&spec),
            Err(_) => std::env::var("DATABASE_URL")
                .map(|url| {
                    vec![NamedConnection {
                        name: "default".to_string(),
                        url,
                    }]
                })
                .unwrap_or_default(),
        };

        Self {
            connections,
            pool_size: env_or("DB_POOL_MAX_SIZE", default_pool_size()),
        }
    }
}

/// What to do with a symbol whose fetch succeeded but whose write failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistFailurePolicy {
    /// Log the failure and move on; the symbol is not retried this cycle
    #[default]
    Ignore,
    /// Put the symbol into the retry set so the drain phase re-fetches and re-writes it
    Retry,
}

impl FromStr for PersistFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown persist failure policy: {}", other)),
        }
    }
}

/// Sync cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between cycle triggers
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Number of trades requested per symbol
    #[serde(default = "default_trade_history_size")]
    pub trade_history_size: u32,

    /// Maximum in-flight symbol fetches
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Base name of the per-currency logical databases
    #[serde(default = "default_database_base")]
    pub database_base: String,

    #[serde(default)]
    pub persist_failure_policy: PersistFailurePolicy,

    /// Run one cycle immediately at startup instead of waiting for the first trigger
    #[serde(default)]
    pub run_on_start: bool,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            trade_history_size: default_trade_history_size(),
            max_concurrency: default_max_concurrency(),
            database_base: default_database_base(),
            persist_failure_policy: PersistFailurePolicy::default(),
            run_on_start: false,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval_secs: env_or("SYNC_INTERVAL_SECS", defaults.interval_secs),
            trade_history_size: env_or("SYNC_TRADE_HISTORY_SIZE", defaults.trade_history_size),
            max_concurrency: env_or("SYNC_MAX_CONCURRENCY", defaults.max_concurrency),
            database_base: std::env::var("SYNC_DATABASE_BASE").unwrap_or(defaults.database_base),
            persist_failure_policy: env_or(
                "SYNC_PERSIST_FAILURE_POLICY",
                defaults.persist_failure_policy,
            ),
            run_on_start: env_or("SYNC_RUN_ON_START", defaults.run_on_start),
            retry: RetryConfig::from_env(),
        }
    }

    /// Cycle interval, never shorter than one second
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Retry-drain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Drain passes before a failing symbol is abandoned for the cycle
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first drain pass, in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for the backoff delay, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random extra delay added to each pass, in milliseconds
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ms: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.max_attempts),
            initial_delay_ms: env_or("RETRY_INITIAL_DELAY_MS", defaults.initial_delay_ms),
            max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.max_delay_ms),
            backoff_multiplier: env_or("RETRY_BACKOFF_MULTIPLIER", defaults.backoff_multiplier),
            jitter_ms: env_or("RETRY_JITTER_MS", defaults.jitter_ms),
        }
    }

    /// Backoff before drain pass `pass` (1-based), without jitter
    pub fn backoff(&self, pass: u32) -> Duration {
        let exponent = pass.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Logging destinations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory of the daily-rotated log file
    #[serde(default = "default_log_dir")]
    pub dir: String,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Minimum level written to the log file
    #[serde(default = "default_file_level")]
    pub file_level: String,

    /// Console filter used when RUST_LOG is not set
    #[serde(default = "default_console_filter")]
    pub console_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            file_prefix: default_log_file_prefix(),
            file_level: default_file_level(),
            console_filter: default_console_filter(),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dir: std::env::var("LOG_DIR").unwrap_or(defaults.dir),
            file_prefix: std::env::var("LOG_FILE_PREFIX").unwrap_or(defaults.file_prefix),
            file_level: std::env::var("LOG_FILE_LEVEL").unwrap_or(defaults.file_level),
            console_filter: defaults.console_filter,
        }
    }
}

/// Parse "name=url,name=url" into connections, skipping malformed pairs
pub fn parse_connections(spec: &str) -> Vec<NamedConnection> {
    spec.split(',')
        .filter_map(|pair| {
            let (name, url) = pair.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                tracing::warn!("Ignoring malformed storage connection entry: {:?}", pair);
                return None;
            }
            Some(NamedConnection {
                name: name.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

fn parse_proxy_url(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// Default value functions for serde
fn default_base_url() -> String {
    "https://api.huobipro.com".to_string()
}

fn default_proxy_url() -> Option<String> {
    Some("socks5h://127.0.0.1:1080".to_string())
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("trade-sync/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_interval() -> u64 {
    60
}

fn default_trade_history_size() -> u32 {
    2000
}

fn default_max_concurrency() -> usize {
    16
}

fn default_database_base() -> String {
    "Tradedata".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> u64 {
    250
}

fn default_log_dir() -> String {
    "/tmp".to_string()
}

fn default_log_file_prefix() -> String {
    "huobi-sync.log".to_string()
}

fn default_file_level() -> String {
    "info".to_string()
}

fn default_console_filter() -> String {
    "trade_sync=debug".to_string()
}
