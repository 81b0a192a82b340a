//! Pipeline configuration
//!
//! Defaults live in constants; `from_env` reads `SHIPTRACK_*` variables
//! (after loading a `.env` file if present) and the builder covers
//! programmatic use.

use serde::{Deserialize, Serialize};
use shiptrack_common::{Result, TrackError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::parser::DEFAULT_FALLBACK_FORMATS;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Concurrent workers per stage.
pub const DEFAULT_WORKERS: usize = 35;

/// Retries after the first attempt, for transient failures only.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Delay before the first retry.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 300;

/// Growth factor applied to the delay for each further retry.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Upper bound on a single backoff delay.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;

/// Per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Minimum percentage change between two progress reports.
pub const DEFAULT_PROGRESS_STEP: u8 = 5;

pub const DEFAULT_STORE_ROOT: &str = "./shiptrack-data";

pub const DEFAULT_ID_SEPARATOR: &str = ",";

/// Bounded exponential backoff for transient fetch failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based): `base * factor^(retry - 1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Everything a tracking run needs to know about its partner and resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub partner_name: String,

    /// Endpoint template, e.g. `https://api.partner.com/track?ids={ids}`
    pub url_template: String,

    /// Split a batch across several requests of at most this many identifiers
    pub ids_per_request: Option<usize>,

    pub id_separator: String,

    /// Worker count for each stage
    pub workers: usize,

    pub retry: RetryPolicy,

    pub request_timeout_secs: u64,

    /// Root directory of the durable intermediate store
    pub store_root: PathBuf,

    /// Minimum percentage points between progress reports
    pub progress_step: u8,

    /// Keep raw responses after their batch parses successfully
    pub retain_raw: bool,

    /// chrono formats tried, in order, when a scan timestamp is not strict ISO-8601
    pub datetime_formats: Vec<String>,
}

impl PipelineConfig {
    /// Config with defaults for everything but the partner
    pub fn new(partner_name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            partner_name: partner_name.into(),
            url_template: url_template.into(),
            ids_per_request: None,
            id_separator: DEFAULT_ID_SEPARATOR.to_string(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            store_root: PathBuf::from(DEFAULT_STORE_ROOT),
            progress_step: DEFAULT_PROGRESS_STEP,
            retain_raw: true,
            datetime_formats: DEFAULT_FALLBACK_FORMATS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }

    pub fn builder(
        partner_name: impl Into<String>,
        url_template: impl Into<String>,
    ) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::new(partner_name, url_template),
        }
    }

    /// Load configuration from the environment
    ///
    /// Required: `SHIPTRACK_PARTNER`, `SHIPTRACK_URL_TEMPLATE`.
    /// Optional: `SHIPTRACK_WORKERS`, `SHIPTRACK_IDS_PER_REQUEST`,
    /// `SHIPTRACK_ID_SEPARATOR`, `SHIPTRACK_MAX_RETRIES`,
    /// `SHIPTRACK_BACKOFF_BASE_MS`, `SHIPTRACK_BACKOFF_FACTOR`,
    /// `SHIPTRACK_BACKOFF_MAX_MS`, `SHIPTRACK_REQUEST_TIMEOUT_SECS`,
    /// `SHIPTRACK_STORE_ROOT`, `SHIPTRACK_PROGRESS_STEP`,
    /// `SHIPTRACK_RETAIN_RAW`, `SHIPTRACK_DATETIME_FORMATS` (`;`-separated).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let partner = std::env::var("SHIPTRACK_PARTNER")
            .map_err(|_| TrackError::Config("SHIPTRACK_PARTNER is not set".to_string()))?;
        let template = std::env::var("SHIPTRACK_URL_TEMPLATE")
            .map_err(|_| TrackError::Config("SHIPTRACK_URL_TEMPLATE is not set".to_string()))?;

        let mut config = Self::new(partner, template);
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override optional fields from `SHIPTRACK_*` variables that are set
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(workers) = env_parse("SHIPTRACK_WORKERS")? {
            self.workers = workers;
        }
        if let Some(limit) = env_parse("SHIPTRACK_IDS_PER_REQUEST")? {
            self.ids_per_request = Some(limit);
        }
        if let Ok(separator) = std::env::var("SHIPTRACK_ID_SEPARATOR") {
            self.id_separator = separator;
        }
        if let Some(retries) = env_parse("SHIPTRACK_MAX_RETRIES")? {
            self.retry.max_retries = retries;
        }
        if let Some(base) = env_parse("SHIPTRACK_BACKOFF_BASE_MS")? {
            self.retry.base_delay_ms = base;
        }
        if let Some(factor) = env_parse("SHIPTRACK_BACKOFF_FACTOR")? {
            self.retry.factor = factor;
        }
        if let Some(max) = env_parse("SHIPTRACK_BACKOFF_MAX_MS")? {
            self.retry.max_delay_ms = max;
        }
        if let Some(timeout) = env_parse("SHIPTRACK_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = timeout;
        }
        if let Ok(root) = std::env::var("SHIPTRACK_STORE_ROOT") {
            self.store_root = PathBuf::from(root);
        }
        if let Some(step) = env_parse("SHIPTRACK_PROGRESS_STEP")? {
            self.progress_step = step;
        }
        if let Some(retain) = env_parse("SHIPTRACK_RETAIN_RAW")? {
            self.retain_raw = retain;
        }
        if let Ok(formats) = std::env::var("SHIPTRACK_DATETIME_FORMATS") {
            self.datetime_formats = formats
                .split(';')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.partner_name.trim().is_empty() {
            return Err(TrackError::Config("partner name cannot be empty".to_string()));
        }
        if self.partner_name.contains(['/', '\\']) {
            return Err(TrackError::Config(
                "partner name cannot contain path separators".to_string(),
            ));
        }
        if self.url_template.trim().is_empty() {
            return Err(TrackError::Config("URL template cannot be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(TrackError::Config("workers must be greater than 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(TrackError::Config(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        if self.progress_step == 0 || self.progress_step > 100 {
            return Err(TrackError::Config(
                "progress step must be between 1 and 100".to_string(),
            ));
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(TrackError::Config(
                "backoff factor must be a finite number >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TrackError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn ids_per_request(mut self, limit: usize) -> Self {
        self.config.ids_per_request = Some(limit);
        self
    }

    pub fn id_separator(mut self, separator: impl Into<String>) -> Self {
        self.config.id_separator = separator.into();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.store_root = root.into();
        self
    }

    pub fn progress_step(mut self, step: u8) -> Self {
        self.config.progress_step = step;
        self
    }

    pub fn retain_raw(mut self, retain: bool) -> Self {
        self.config.retain_raw = retain;
        self
    }

    pub fn datetime_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.datetime_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and return the config
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new("acme", "https://acme.test/track?ids={ids}");
        assert_eq!(config.workers, 35);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.progress_step, 5);
        assert!(config.retain_raw);
        assert!(!config.datetime_formats.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 300,
            factor: 2.0,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(600));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(9), Duration::from_millis(1_000));
    }

    #[test]
    fn test_builder_validates() {
        assert!(PipelineConfig::builder("acme", "https://acme.test/")
            .workers(0)
            .build()
            .is_err());
        assert!(PipelineConfig::builder("", "https://acme.test/").build().is_err());
        assert!(PipelineConfig::builder("ac/me", "https://acme.test/").build().is_err());
        assert!(PipelineConfig::builder("acme", "https://acme.test/")
            .retry(RetryPolicy {
                factor: 0.5,
                ..RetryPolicy::default()
            })
            .build()
            .is_err());

        let config = PipelineConfig::builder("acme", "https://acme.test/")
            .workers(4)
            .ids_per_request(50)
            .progress_step(10)
            .retain_raw(false)
            .datetime_formats(["%d.%m.%Y %H:%M"])
            .build()
            .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.ids_per_request, Some(50));
        assert!(!config.retain_raw);
        assert_eq!(config.datetime_formats, vec!["%d.%m.%Y %H:%M".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SHIPTRACK_WORKERS", "12");
        std::env::set_var("SHIPTRACK_DATETIME_FORMATS", "%Y/%m/%d %H:%M; %d-%m-%Y");

        let mut config = PipelineConfig::new("acme", "https://acme.test/");
        config.apply_env().unwrap();
        assert_eq!(config.workers, 12);
        assert_eq!(config.datetime_formats.len(), 2);

        std::env::set_var("SHIPTRACK_WORKERS", "many");
        assert!(config.apply_env().is_err());

        std::env::remove_var("SHIPTRACK_WORKERS");
        std::env::remove_var("SHIPTRACK_DATETIME_FORMATS");
    }
}
