use crate::{error::DataError, instrument::SymbolClass, store::HISTORY_LIMIT};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tracing::warn;

/// Default Upstox v2 REST base url.
pub const DEFAULT_BASE_URL: &str = "https://api.upstox.com/v2";

/// Complete service configuration.
///
/// Every field has a default, so an empty TOML document is a valid configuration. Values
/// are resolved in order: defaults, then the optional TOML file, then `GAMMA_*` and
/// `UPSTOX_*` environment variables, then CLI flags applied by the binary.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub upstream: UpstreamConfig,
    pub calendar: CalendarConfig,
    pub fetcher: FetcherConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub expiry: ExpiryConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// JSON token file maintained by the external OAuth flow.
    pub token_file: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 10,
            token_file: None,
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// IANA time zone name of the exchange.
    pub timezone: String,
    /// Local session open, `HH:MM`.
    pub open: String,
    /// Local session close, `HH:MM`.
    pub close: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            open: "09:15".to_string(),
            close: "15:30".to_string(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub batch_delay_ms: u64,
    pub request_spacing_ms: u64,
    pub rate_limit_cooldown_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: 3,
            batch_delay_ms: 1_000,
            request_spacing_ms: 200,
            rate_limit_cooldown_secs: 10,
        }
    }
}

impl FetcherConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn request_spacing(&self) -> Duration {
        Duration::from_millis(self.request_spacing_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub rate_limit_retries: u32,
    pub rate_limit_base_secs: u64,
    pub network_retries: u32,
    pub network_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_retries: 2,
            rate_limit_base_secs: 5,
            network_retries: 2,
            network_delay_secs: 5,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub fast_interval_secs: u64,
    pub slow_interval_secs: u64,
    pub closed_poll_secs: u64,
    pub failure_budget: u32,
    pub credential_failure_budget: u32,
    /// Base of the escalating delay after a failed pass, multiplied by the failure count.
    pub failure_backoff_secs: u64,
    /// Ignore the market-hours gate.
    pub force: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: 30,
            slow_interval_secs: 180,
            closed_poll_secs: 60,
            failure_budget: 5,
            credential_failure_budget: 20,
            failure_backoff_secs: 10,
            force: false,
        }
    }
}

impl SchedulerConfig {
    pub fn closed_poll(&self) -> Duration {
        Duration::from_secs(self.closed_poll_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExpiryConfig {
    pub index_count: usize,
    pub equity_count: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            index_count: 2,
            equity_count: 1,
        }
    }
}

impl ExpiryConfig {
    pub fn max_count(&self, class: SymbolClass) -> usize {
        match class {
            SymbolClass::Index => self.index_count,
            SymbolClass::Equity => self.equity_count,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Raw snapshots retained per (symbol, expiry).
    pub raw_retention: usize,
    /// Summary rows retained per (symbol, expiry). Never below the detector history window.
    pub summary_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            raw_retention: 50,
            summary_retention: 500,
        }
    }
}

impl ServiceConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, DataError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|error| {
                    DataError::Config(format!("failed to read {}: {error}", path.display()))
                })?;
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, DataError> {
        toml::from_str(contents).map_err(|error| DataError::Config(error.to_string()))
    }

    /// Apply `GAMMA_*` / `UPSTOX_*` overrides from the provided lookup.
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparsable config override");
                    None
                }
            }
        }

        if let Some(base_url) = lookup("UPSTOX_BASE_URL") {
            self.upstream.base_url = base_url;
        }
        if let Some(token_file) = lookup("UPSTOX_TOKEN_FILE") {
            self.upstream.token_file = Some(PathBuf::from(token_file));
        }
        if let Some(value) = parsed(&lookup, "GAMMA_FAST_INTERVAL_SECS") {
            self.scheduler.fast_interval_secs = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_SLOW_INTERVAL_SECS") {
            self.scheduler.slow_interval_secs = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_FORCE") {
            self.scheduler.force = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_BATCH_SIZE") {
            self.fetcher.batch_size = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_WORKERS") {
            self.fetcher.workers = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_RATE_LIMIT_RETRIES") {
            self.retry.rate_limit_retries = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_NETWORK_RETRIES") {
            self.retry.network_retries = value;
        }
        if let Some(value) = parsed(&lookup, "GAMMA_SUMMARY_RETENTION") {
            self.store.summary_retention = value;
        }
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.fetcher.batch_size == 0 {
            return Err(DataError::Config("fetcher.batch_size must be > 0".to_string()));
        }
        if self.fetcher.workers == 0 {
            return Err(DataError::Config("fetcher.workers must be > 0".to_string()));
        }
        if self.scheduler.fast_interval_secs == 0 || self.scheduler.slow_interval_secs == 0 {
            return Err(DataError::Config(
                "scheduler intervals must be > 0 seconds".to_string(),
            ));
        }
        if self.expiry.index_count == 0 || self.expiry.equity_count == 0 {
            return Err(DataError::Config("expiry counts must be > 0".to_string()));
        }
        if self.store.summary_retention < HISTORY_LIMIT {
            return Err(DataError::Config(format!(
                "store.summary_retention must be >= {HISTORY_LIMIT}"
            )));
        }
        url::Url::parse(&self.upstream.base_url)
            .map_err(|error| DataError::Config(format!("invalid upstream.base_url: {error}")))?;
        Ok(())
    }
}
