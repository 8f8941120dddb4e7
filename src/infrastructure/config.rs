//! Configuration infrastructure
//!
//! Contains configuration loading and management for crawl coordination.
//!
//! Configuration is layered:
//! 1. Built-in defaults (see [`defaults`])
//! 2. Config file (JSON or TOML, optional)
//! 3. Environment overrides `CRAWL_COORD__SECTION__FIELD`

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::derivable_impls)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::domain::{CanonicalPolicy, FingerprintError, Offset};
use crate::infrastructure::store::KeySpace;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CRAWL_COORD";

/// Separator between prefix, section and field in environment keys
pub const ENV_SEPARATOR: &str = "__";

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identity of the crawl source this worker serves
    pub source: SourceConfig,

    /// Shared coordination store connection and key naming
    pub store: StoreConfig,

    /// Work queue leasing
    pub queue: QueueConfig,

    /// Fingerprint canonicalization and remote authority
    pub dedup: DedupConfig,

    /// Proxy leasing
    pub proxy: ProxyConfig,

    /// Incremental cursor tracking
    pub cursor: CursorConfig,

    /// Worker loop tuning
    pub worker: WorkerConfig,

    /// Remote round reporting
    pub reporter: ReporterConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Deployment region; decides whether the remote dedup authority is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    Domestic,
    Overseas,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Crawl source name; namespaces queue and dedup keys
    pub name: String,

    /// Numeric site identifier shared with the cursor store and log endpoints
    pub site_id: i64,

    /// Identifier of this worker host in remote logs
    pub client_id: String,

    pub locale: Locale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Prefix of the per-source fingerprint set
    pub dedup_prefix: String,

    /// Prefix of the per-source request queue
    pub queue_prefix: String,

    /// Global proxy pool key
    pub proxy_pool_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lease duration applied by `pop`, in milliseconds
    pub lease_ms: u64,

    /// Maximum requests leased per pop
    pub pop_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Keep URL fragments when canonicalizing
    pub keep_fragments: bool,

    /// Regex of query parameter names stripped before hashing; `None` strips nothing
    pub tracking_params_pattern: Option<String>,

    /// Remote authority lookup URL, consulted for domestic sources
    pub remote_endpoint: Option<String>,

    /// Remote lookup timeout in seconds
    pub remote_timeout_secs: u64,

    /// Items published longer ago than this are dropped; `None` keeps every item
    pub item_max_age_hours: Option<u64>,

    /// Write expired items to the fingerprint store so they stop resurfacing
    pub record_expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Per-request leases from the shared pool
    Rotating,
    /// One fixed endpoint for every request
    Tunnel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ProxyMode,

    /// Lease validity in milliseconds
    pub ttl_ms: u64,

    /// Endpoints pulled per refill; also the local cache bound
    pub prefetch: usize,

    /// Back-off after an empty refill, in milliseconds
    pub empty_wait_ms: u64,

    /// Consecutive empty refills before logging at error level
    pub escalate_after: u32,

    /// Fixed endpoint for tunnel mode
    pub tunnel_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Track an incremental cursor for this source
    pub enabled: bool,

    /// Name of the tracked cursor field
    pub cursor_name: String,

    /// IDs probed below the cursor
    pub offset_back: i64,

    /// IDs probed from the cursor upwards
    pub offset_forward: i64,

    /// Read and write the repository; otherwise use `mock_cursor`
    pub production: bool,

    /// Starting cursor outside production
    pub mock_cursor: i64,

    /// sqlx database URL of the cursor repository
    pub database_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Requests processed concurrently
    pub concurrency: usize,

    /// Transport retries per request before it is left for redelivery
    pub max_retries: u32,

    /// Fetch rate limit; 0 disables limiting
    pub requests_per_second: u32,

    /// Sleep after an empty pop, in milliseconds
    pub idle_wait_ms: u64,

    /// Consecutive empty pops before the worker stops; 0 runs until cancelled
    pub max_idle_polls: u32,

    /// Base back-off after a store error, in milliseconds
    pub store_backoff_base_ms: u64,

    /// Back-off ceiling, in milliseconds
    pub store_backoff_max_ms: u64,

    /// Consecutive store errors tolerated before the worker gives up
    pub max_store_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    NoLog,
    Section,
    Increment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub log_type: LogType,

    /// Endpoint receiving round logs
    pub log_url: Option<String>,

    /// Section report interval in seconds
    pub interval_secs: u64,

    /// HTTP timeout in seconds
    pub timeout_secs: u64,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Log directory; defaults to `logs/` next to the executable
    pub directory: Option<PathBuf>,

    /// Log file name
    pub file_name: String,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Enable automatic log cleanup on startup
    pub auto_cleanup_logs: bool,

    /// Offset from UTC for log timestamps, in hours
    pub utc_offset_hours: i32,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "redis": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            dedup: DedupConfig::default(),
            proxy: ProxyConfig::default(),
            cursor: CursorConfig::default(),
            worker: WorkerConfig::default(),
            reporter: ReporterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: defaults::SOURCE_NAME.to_string(),
            site_id: 0,
            client_id: defaults::CLIENT_ID.to_string(),
            locale: Locale::Overseas,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: defaults::REDIS_URL.to_string(),
            dedup_prefix: defaults::DEDUP_PREFIX.to_string(),
            queue_prefix: defaults::QUEUE_PREFIX.to_string(),
            proxy_pool_key: defaults::PROXY_POOL_KEY.to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ms: defaults::LEASE_MS,
            pop_batch: defaults::POP_BATCH,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            keep_fragments: false,
            tracking_params_pattern: Some(crate::domain::fingerprint::DEFAULT_TRACKING_PATTERN.to_string()),
            remote_endpoint: None,
            remote_timeout_secs: defaults::REMOTE_TIMEOUT_SECS,
            item_max_age_hours: None,
            record_expired: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Rotating,
            ttl_ms: defaults::PROXY_TTL_MS,
            prefetch: defaults::PROXY_PREFETCH,
            empty_wait_ms: defaults::PROXY_EMPTY_WAIT_MS,
            escalate_after: defaults::PROXY_ESCALATE_AFTER,
            tunnel_endpoint: None,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cursor_name: defaults::CURSOR_NAME.to_string(),
            offset_back: defaults::OFFSET_BACK,
            offset_forward: defaults::OFFSET_FORWARD,
            production: true,
            mock_cursor: 0,
            database_url: defaults::CURSOR_DATABASE_URL.to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::WORKER_CONCURRENCY,
            max_retries: defaults::MAX_RETRIES,
            requests_per_second: 0,
            idle_wait_ms: defaults::IDLE_WAIT_MS,
            max_idle_polls: 0,
            store_backoff_base_ms: defaults::STORE_BACKOFF_BASE_MS,
            store_backoff_max_ms: defaults::STORE_BACKOFF_MAX_MS,
            max_store_errors: defaults::MAX_STORE_ERRORS,
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            log_type: LogType::NoLog,
            log_url: None,
            interval_secs: defaults::REPORT_INTERVAL_SECS,
            timeout_secs: defaults::REPORT_TIMEOUT_SECS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            directory: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: defaults::LOG_AUTO_CLEANUP,
            utc_offset_hours: 0,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("redis".to_string(), "warn".to_string());
                filters
            },
        }
    }
}

impl StoreConfig {
    /// Key layout for `source`
    #[must_use]
    pub fn key_space(&self, source: &str) -> KeySpace {
        KeySpace::new(&self.dedup_prefix, &self.queue_prefix, &self.proxy_pool_key, source)
    }
}

impl DedupConfig {
    pub fn policy(&self) -> Result<CanonicalPolicy, FingerprintError> {
        CanonicalPolicy::new(self.keep_fragments, self.tracking_params_pattern.as_deref())
    }

    #[must_use]
    pub fn item_max_age(&self) -> Option<Duration> {
        self.item_max_age_hours.map(|hours| Duration::from_secs(hours * 3600))
    }
}

impl CursorConfig {
    #[must_use]
    pub const fn offset(&self) -> Option<Offset> {
        Offset::new(self.offset_back, self.offset_forward)
    }
}

impl AppConfig {
    /// Rejects settings the coordination components cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.source.name.trim().is_empty(), "source.name must not be empty");
        ensure!(self.queue.lease_ms > 0, "queue.lease_ms must be positive");
        ensure!(self.queue.pop_batch > 0, "queue.pop_batch must be positive");
        ensure!(self.proxy.ttl_ms > 0, "proxy.ttl_ms must be positive");
        ensure!(self.proxy.prefetch > 0, "proxy.prefetch must be positive");
        ensure!(self.worker.concurrency > 0, "worker.concurrency must be positive");

        if self.proxy.mode == ProxyMode::Tunnel {
            ensure!(
                self.proxy.tunnel_endpoint.is_some(),
                "proxy.tunnel_endpoint is required in tunnel mode"
            );
        }

        if self.source.locale == Locale::Domestic {
            ensure!(
                self.dedup.remote_endpoint.is_some(),
                "dedup.remote_endpoint is required for domestic sources"
            );
        }

        if self.cursor.enabled {
            ensure!(
                self.cursor.offset().is_some(),
                "cursor offsets must be non-negative (back={}, forward={})",
                self.cursor.offset_back,
                self.cursor.offset_forward
            );
            ensure!(!self.cursor.cursor_name.trim().is_empty(), "cursor.cursor_name must not be empty");
        }

        if self.reporter.log_type != LogType::NoLog {
            ensure!(
                self.reporter.log_url.is_some(),
                "reporter.log_url is required for {:?} reporting",
                self.reporter.log_type
            );
            ensure!(self.reporter.interval_secs > 0, "reporter.interval_secs must be positive");
        }

        ensure!(
            self.dedup.item_max_age_hours != Some(0),
            "dedup.item_max_age_hours must be positive when set"
        );

        self.dedup
            .policy()
            .context("dedup.tracking_params_pattern is not a valid regex")?;

        Ok(())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("crawl-coord");

        Ok(config_dir)
    }

    /// Create a configuration manager for the default location
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        let config_path = config_dir.join("crawl_coord.json");

        Ok(Self { config_path })
    }

    /// Create a configuration manager for an explicit file
    #[must_use]
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Initialize configuration system on first run
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        if self.config_path.exists() {
            return self.load_config();
        }

        info!("🎉 First run detected - writing default configuration");
        let default_config = AppConfig::default();
        self.save_config(&default_config).await?;
        info!("✅ Initial configuration setup completed");

        Ok(default_config)
    }

    /// Load file + environment layers; a missing file yields defaults
    pub fn load_config(&self) -> Result<AppConfig> {
        self.load_layered(None)
    }

    /// Same as [`Self::load_config`] with an explicit environment map
    pub fn load_config_with_env(&self, env: HashMap<String, String>) -> Result<AppConfig> {
        self.load_layered(Some(env))
    }

    fn load_layered(&self, env: Option<HashMap<String, String>>) -> Result<AppConfig> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env.map(|vars| vars.into_iter().collect()));

        let settings = config::Config::builder()
            .add_source(config::File::from(self.config_path.as_path()).required(false))
            .add_source(environment)
            .build()
            .with_context(|| format!("Failed to read configuration from {:?}", self.config_path))?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Configuration has an invalid shape")?;
        config.validate()?;

        info!("Loaded configuration for source '{}'", config.source.name);
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Get the configuration file path
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Default coordination configuration values
pub mod defaults {
    /// Default crawl source name
    pub const SOURCE_NAME: &str = "default";

    /// Default client identifier in remote logs
    pub const CLIENT_ID: &str = "crawl-worker";

    /// Default Redis URL
    pub const REDIS_URL: &str = "redis://127.0.0.1:6379/0";

    /// Fingerprint set prefix
    pub const DEDUP_PREFIX: &str = "dedup";

    /// Request queue prefix
    pub const QUEUE_PREFIX: &str = "requestqueue";

    /// Global proxy pool key
    pub const PROXY_POOL_KEY: &str = "proxies_pool";

    /// Queue lease in milliseconds
    pub const LEASE_MS: u64 = 20_000;

    /// Requests leased per pop
    pub const POP_BATCH: usize = 16;

    /// Remote authority timeout in seconds
    pub const REMOTE_TIMEOUT_SECS: u64 = 10;

    /// Proxy lease TTL in milliseconds
    pub const PROXY_TTL_MS: u64 = 30_000;

    /// Proxies pulled per refill
    pub const PROXY_PREFETCH: usize = 64;

    /// Back-off after an empty proxy refill in milliseconds
    pub const PROXY_EMPTY_WAIT_MS: u64 = 5_000;

    /// Empty refills before escalating the log level
    pub const PROXY_ESCALATE_AFTER: u32 = 3;

    /// Default tracked cursor name
    pub const CURSOR_NAME: &str = "cursor";

    /// IDs probed below the cursor
    pub const OFFSET_BACK: i64 = 0;

    /// IDs probed above the cursor
    pub const OFFSET_FORWARD: i64 = 100;

    /// Cursor repository location
    pub const CURSOR_DATABASE_URL: &str = "sqlite:data/cursor_state.db";

    /// Concurrent requests per worker
    pub const WORKER_CONCURRENCY: usize = 8;

    /// Transport retries per request
    pub const MAX_RETRIES: u32 = 3;

    /// Sleep after an empty pop in milliseconds
    pub const IDLE_WAIT_MS: u64 = 1_000;

    /// Base store error back-off in milliseconds
    pub const STORE_BACKOFF_BASE_MS: u64 = 500;

    /// Store error back-off ceiling in milliseconds
    pub const STORE_BACKOFF_MAX_MS: u64 = 30_000;

    /// Consecutive store errors before the worker stops
    pub const MAX_STORE_ERRORS: u32 = 10;

    /// Section report interval in seconds
    pub const REPORT_INTERVAL_SECS: u64 = 60;

    /// Report HTTP timeout in seconds
    pub const REPORT_TIMEOUT_SECS: u64 = 10;

    /// Default log level
    pub const LOG_LEVEL: &str = "info";

    /// Default JSON format setting
    pub const LOG_JSON_FORMAT: bool = false;

    /// Default console output setting
    pub const LOG_CONSOLE_OUTPUT: bool = true;

    /// Default file output setting
    pub const LOG_FILE_OUTPUT: bool = false;

    /// Default log file name
    pub const LOG_FILE_NAME: &str = "crawl-coord.log";

    /// Default maximum log files to keep
    pub const LOG_MAX_FILES: u32 = 5;

    /// Default auto cleanup logs setting
    pub const LOG_AUTO_CLEANUP: bool = true;
}
