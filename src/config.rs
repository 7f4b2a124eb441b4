//! Exporter configuration
//!
//! Provides layered configuration management with:
//! - Runtime defaults
//! - Config file loading (optional)
//! - Environment variable overrides
//! - Validation before anything touches the network

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::models::ResourceType;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Upstream API credentials and endpoint
    pub api: ApiConfig,

    /// Polling cadence and window
    pub scrape: ScrapeConfig,

    /// Metrics HTTP listener
    pub server: ServerConfig,

    /// Deduplication ledger behaviour
    pub ledger: LedgerConfig,

    /// File the configuration was read from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub directory: PathBuf,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Admin API key used as the bearer credential
    pub secret_key: String,
    pub organization_id: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Page size requested from the usage endpoints
    pub page_limit: u32,
}

// Keeps the credential out of debug logs.
impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("secret_key", &"<redacted>")
            .field("organization_id", &self.organization_id)
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub interval_secs: u64,
    /// How far behind the cursor each usage window starts
    pub query_offset_secs: u64,
    pub cost_interval_secs: u64,
    pub costs_enabled: bool,
    pub resources: Vec<ResourceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Publish partial progress of still-open buckets via delta accounting
    pub track_open_buckets: bool,
    /// Entries whose bucket started longer ago than this are evicted
    pub retention_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
            directory: PathBuf::from("logs"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            organization_id: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            request_timeout_secs: 30,
            page_limit: 1440,
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            query_offset_secs: 15 * 60,
            cost_interval_secs: 24 * 60 * 60,
            costs_enabled: true,
            resources: ResourceType::ALL.to_vec(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            track_open_buckets: true,
            retention_secs: 6 * 60 * 60,
        }
    }
}

impl Config {
    /// Load configuration from file, environment and defaults.
    ///
    /// An explicit `path` must exist; otherwise the well-known locations are
    /// checked in order and the first one found wins.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let source = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::discover(),
        };

        let mut config = match &source {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.source = source;

        config.apply_env_overrides()?;

        Ok(config)
    }

    fn discover() -> Option<PathBuf> {
        let config_paths = [
            Some(PathBuf::from("openai-exporter.toml")),
            Some(PathBuf::from(".openai-exporter.toml")),
            dirs::config_dir().map(|d| d.join("openai-exporter").join("config.toml")),
        ];

        config_paths.into_iter().flatten().find(|path| path.is_file())
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Logging overrides
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        // API overrides
        if let Ok(val) = env::var("OPENAI_SECRET_KEY") {
            self.api.secret_key = val;
        }
        if let Ok(val) = env::var("OPENAI_ORG_ID") {
            self.api.organization_id = val;
        }
        if let Ok(val) = env::var("OPENAI_API_BASE_URL") {
            self.api.base_url = val;
        }

        // Scrape overrides
        if let Ok(val) = env::var("OPENAI_EXPORTER_SCRAPE_INTERVAL_SECS") {
            self.scrape.interval_secs = val
                .parse()
                .context("Invalid OPENAI_EXPORTER_SCRAPE_INTERVAL_SECS")?;
        }
        if let Ok(val) = env::var("OPENAI_EXPORTER_QUERY_OFFSET_SECS") {
            self.scrape.query_offset_secs = val
                .parse()
                .context("Invalid OPENAI_EXPORTER_QUERY_OFFSET_SECS")?;
        }
        if let Ok(val) = env::var("OPENAI_EXPORTER_COST_INTERVAL_SECS") {
            self.scrape.cost_interval_secs = val
                .parse()
                .context("Invalid OPENAI_EXPORTER_COST_INTERVAL_SECS")?;
        }
        if let Ok(val) = env::var("OPENAI_EXPORTER_RESOURCES") {
            self.scrape.resources = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<ResourceType>())
                .collect::<Result<Vec<_>>>()
                .context("Invalid OPENAI_EXPORTER_RESOURCES")?;
        }

        // Server overrides
        if let Ok(val) = env::var("OPENAI_EXPORTER_LISTEN_ADDR") {
            self.server.listen_addr = val;
        }

        // Ledger overrides
        if let Ok(val) = env::var("OPENAI_EXPORTER_TRACK_OPEN_BUCKETS") {
            self.ledger.track_open_buckets = val
                .parse()
                .context("Invalid OPENAI_EXPORTER_TRACK_OPEN_BUCKETS")?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.api.secret_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "OPENAI_SECRET_KEY environment variable is required"
            ));
        }

        if self.api.organization_id.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "OPENAI_ORG_ID environment variable is required"
            ));
        }

        if self.scrape.interval_secs == 0 {
            return Err(anyhow::anyhow!("Scrape interval must be greater than 0"));
        }

        if self.scrape.costs_enabled && self.scrape.cost_interval_secs == 0 {
            return Err(anyhow::anyhow!("Cost interval must be greater than 0"));
        }

        if self.scrape.resources.is_empty() {
            return Err(anyhow::anyhow!("At least one resource type must be enabled"));
        }

        if self.api.page_limit == 0 {
            return Err(anyhow::anyhow!("Page limit must be greater than 0"));
        }

        // An evicted key that can still be fetched would be counted twice.
        let lookback = self
            .scrape
            .query_offset_secs
            .saturating_add(self.scrape.interval_secs);
        if self.ledger.retention_secs <= lookback {
            return Err(anyhow::anyhow!(
                "Ledger retention ({}s) must exceed query offset plus scrape interval ({}s)",
                self.ledger.retention_secs,
                lookback
            ));
        }

        if self.scrape.query_offset_secs < self.scrape.interval_secs {
            warn!(
                query_offset_secs = self.scrape.query_offset_secs,
                interval_secs = self.scrape.interval_secs,
                "Query offset is shorter than the scrape interval, late-arriving buckets may be missed"
            );
        }

        Ok(())
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape.interval_secs)
    }

    pub fn query_offset(&self) -> Duration {
        Duration::from_secs(self.scrape.query_offset_secs)
    }

    pub fn cost_interval(&self) -> Duration {
        Duration::from_secs(self.scrape.cost_interval_secs)
    }

    pub fn ledger_retention(&self) -> Duration {
        Duration::from_secs(self.ledger.retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.api.secret_key = "sk-test".to_string();
        config.api.organization_id = "org-123".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "INFO");
        assert_eq!(config.scrape.interval_secs, 60);
        assert!(config.ledger.track_open_buckets);
        assert_eq!(config.scrape.resources.len(), ResourceType::ALL.len());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config = valid();
        config.api.secret_key.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("OPENAI_SECRET_KEY"));

        let mut config = valid();
        config.api.organization_id.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("OPENAI_ORG_ID"));
    }

    #[test]
    fn test_retention_must_exceed_lookback() {
        let mut config = valid();
        assert!(config.validate().is_ok());

        config.ledger.retention_secs = config.scrape.query_offset_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_records_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        std::fs::write(&path, "[server]\nlisten_addr = \"127.0.0.1:9200\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        assert_eq!(config.server.listen_addr, "127.0.0.1:9200");

        assert!(Config::default().source.is_none());
    }

    #[test]
    fn test_huge_offsets_do_not_wrap_past_retention() {
        let mut config = valid();
        config.scrape.query_offset_secs = u64::MAX;
        config.ledger.retention_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.scrape.query_offset_secs = u64::MAX - 10;
        config.scrape.interval_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = valid();
        let rendered = format!("{:?}", config.api);
        assert!(!rendered.contains("sk-test"));
        assert!(rendered.contains("<redacted>"));
    }
}
