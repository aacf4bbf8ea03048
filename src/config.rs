use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Hard timeout for `request_quote` / `request_profile` waits
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointConfig::default(),
            scheduler: SchedulerConfig::default(),
            fetcher: FetcherConfig::default(),
            streaming: StreamingConfig::default(),
            cache: CacheConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the REST proxy (serves /quote, /profile, /market-status)
    pub rest_base_url: String,
    /// Streaming endpoint for live trades
    pub ws_url: String,
    /// Optional API token appended as `token=` to REST and streaming URLs
    #[serde(default)]
    pub api_token: Option<String>,
    /// Exchange code used for market-status polling
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Per-request HTTP timeout in milliseconds
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_exchange() -> String {
    "US".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "http://127.0.0.1:8080/api/market".to_string(),
            ws_url: "wss://ws.finnhub.io".to_string(),
            api_token: None,
            exchange: default_exchange(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum simultaneous fetches
    pub max_concurrent: usize,
    /// Minimum delay between two dispatches in milliseconds
    pub dispatch_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            dispatch_delay_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Attempts per fetch, including the first one
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single retry delay
    pub max_delay_ms: u64,
    /// Global cooldown after the first 429, doubled on each consecutive hit
    pub cooldown_base_ms: u64,
    /// Upper bound for the global cooldown
    pub cooldown_max_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 500,
            max_delay_ms: 12_000,
            cooldown_base_ms: 2_000,
            cooldown_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// First reconnect delay in milliseconds
    pub base_reconnect_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub max_reconnect_ms: u64,
    /// How often to send ping frames
    pub ping_interval_secs: u64,
    /// Recycle the connection after this long without any frame
    pub stale_timeout_secs: u64,
    /// Minimum spacing of baseline quote requests triggered by ticks for one symbol
    #[serde(default = "default_baseline_retry_secs")]
    pub baseline_retry_secs: u64,
}

fn default_baseline_retry_secs() -> u64 {
    60
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            base_reconnect_ms: 1_000,
            max_reconnect_ms: 15_000,
            ping_interval_secs: 30,
            stale_timeout_secs: 90,
            baseline_retry_secs: default_baseline_retry_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub quote_ttl_secs: u64,
    pub profile_ttl_secs: u64,
    pub market_status_ttl_secs: u64,
    /// Persist profiles across runs
    #[serde(default = "default_true")]
    pub durable: bool,
    /// Directory holding the durable profile store (defaults to the user data dir)
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: 10 * 60,
            profile_ttl_secs: 24 * 60 * 60,
            market_status_ttl_secs: 5 * 60,
            durable: true,
            store_dir: None,
        }
    }
}

impl CacheConfig {
    /// Resolved directory for the durable store, if one can be determined
    pub fn resolved_store_dir(&self) -> Option<PathBuf> {
        self.store_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("tickerhub")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = AppConfig::default();

        let builder = Config::builder()
            // Start with default values
            .set_default("endpoints.rest_base_url", defaults.endpoints.rest_base_url)?
            .set_default("endpoints.ws_url", defaults.endpoints.ws_url)?
            .set_default("scheduler.max_concurrent", 2)?
            .set_default("scheduler.dispatch_delay_ms", 500)?
            .set_default("fetcher.max_attempts", 6)?
            .set_default("fetcher.base_delay_ms", 500)?
            .set_default("fetcher.max_delay_ms", 12_000)?
            .set_default("fetcher.cooldown_base_ms", 2_000)?
            .set_default("fetcher.cooldown_max_ms", 60_000)?
            .set_default("streaming.base_reconnect_ms", 1_000)?
            .set_default("streaming.max_reconnect_ms", 15_000)?
            .set_default("streaming.ping_interval_secs", 30)?
            .set_default("streaming.stale_timeout_secs", 90)?
            .set_default("streaming.baseline_retry_secs", 60)?
            .set_default("cache.quote_ttl_secs", 600)?
            .set_default("cache.profile_ttl_secs", 86_400)?
            .set_default("cache.market_status_ttl_secs", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TICKERHUB_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TICKERHUB_ENDPOINTS__WS_URL, etc.)
            .add_source(
                Environment::with_prefix("TICKERHUB")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scheduler.max_concurrent == 0 {
            errors.push("scheduler.max_concurrent must be at least 1".to_string());
        }

        if self.fetcher.max_attempts == 0 {
            errors.push("fetcher.max_attempts must be at least 1".to_string());
        }

        if self.fetcher.base_delay_ms > self.fetcher.max_delay_ms {
            errors.push("fetcher.base_delay_ms must not exceed fetcher.max_delay_ms".to_string());
        }

        if self.streaming.base_reconnect_ms > self.streaming.max_reconnect_ms {
            errors.push(
                "streaming.base_reconnect_ms must not exceed streaming.max_reconnect_ms"
                    .to_string(),
            );
        }

        if self.cache.quote_ttl_secs == 0 || self.cache.profile_ttl_secs == 0 {
            errors.push("cache TTLs must be positive".to_string());
        }

        if Url::parse(&self.endpoints.rest_base_url).is_err() {
            errors.push(format!(
                "endpoints.rest_base_url is not a valid URL: {}",
                self.endpoints.rest_base_url
            ));
        }

        if Url::parse(&self.endpoints.ws_url).is_err() {
            errors.push(format!(
                "endpoints.ws_url is not a valid URL: {}",
                self.endpoints.ws_url
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scheduler.max_concurrent, 2);
        assert_eq!(cfg.scheduler.dispatch_delay(), Duration::from_millis(500));
        assert_eq!(cfg.fetcher.max_delay_ms, 12_000);
        assert_eq!(cfg.streaming.max_reconnect_ms, 15_000);
        assert_eq!(cfg.cache.quote_ttl_secs, 600);
        assert_eq!(cfg.cache.profile_ttl_secs, 86_400);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.max_concurrent = 0;
        cfg.fetcher.max_attempts = 0;
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let cfg = AppConfig::load_from("/nonexistent/tickerhub-config").unwrap();
        assert_eq!(cfg.scheduler.max_concurrent, 2);
        assert_eq!(cfg.endpoints.exchange, "US");
        assert_eq!(cfg.request_timeout_ms, 30_000);
    }
}
