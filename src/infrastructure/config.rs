//! Configuration infrastructure
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (the [`defaults`] module)
//! 2. An optional config file (TOML/JSON/YAML, picked by extension)
//! 3. Environment overrides: `TASKFLOW_<SECTION>__<FIELD>`, e.g.
//!    `TASKFLOW_GATEWAY__TIMEOUT_MS=10000`
//!
//! Durations are stored as milliseconds so files stay human-editable; typed
//! accessors hand out [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::domain::progress::MIN_UNCHANGED_THRESHOLD;

pub const APP_DIR_NAME: &str = "taskflow-engine";
pub const ENV_PREFIX: &str = "TASKFLOW";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Default engine configuration values
pub mod defaults {
    pub const BASE_URL: &str = "http://127.0.0.1:8000";
    pub const USER_AGENT: &str = concat!("taskflow-engine/", env!("CARGO_PKG_VERSION"));

    /// Minimum spacing between two actual dispatches
    pub const MIN_INTERVAL_MS: u64 = 1000;
    /// Per-attempt deadline
    pub const REQUEST_TIMEOUT_MS: u64 = 30_000;
    /// Total attempts for network-level failures (first try included)
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 1000;

    pub const CACHE_DEFAULT_TTL_MS: u64 = 10 * 60 * 1000;
    pub const TASK_LIST_TTL_MS: u64 = 30 * 1000;
    pub const QUOTA_TTL_MS: u64 = 5 * 60 * 1000;
    pub const MARKETING_TTL_MS: u64 = 10 * 60 * 1000;
    pub const PROGRESS_TTL_MS: u64 = 10 * 60 * 1000;

    pub const POLL_INTERVAL_MS: u64 = 5000;
    pub const UNCHANGED_THRESHOLD: u32 = 4;
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
    /// `step_type` for analysis progress
    pub const ANALYSIS_STEP_TYPE: u32 = 2;

    pub const FLOW_CHECK_INTERVAL_MS: u64 = 30_000;
    pub const FLOW_MAX_WAIT_MS: u64 = 30 * 60 * 1000;
    pub const FLOW_MONITOR_PAGE_SIZE: u32 = 100;

    pub const REGISTRY_PAGE_SIZE: u32 = 50;
    pub const REGISTRY_MAX_TASKS: usize = 500;
    pub const AUTO_REFRESH_INTERVAL_MS: u64 = 30_000;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_PREFIX: &str = "taskflow.log";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub polling: PollingConfig,
    pub flow: FlowSettings,
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::BASE_URL.to_string(),
            user_agent: defaults::USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub min_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: defaults::MIN_INTERVAL_MS,
            timeout_ms: defaults::REQUEST_TIMEOUT_MS,
            max_attempts: defaults::MAX_ATTEMPTS,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
        }
    }
}

impl GatewayConfig {
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub task_list_ttl_ms: u64,
    pub quota_ttl_ms: u64,
    pub marketing_ttl_ms: u64,
    pub progress_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: defaults::CACHE_DEFAULT_TTL_MS,
            task_list_ttl_ms: defaults::TASK_LIST_TTL_MS,
            quota_ttl_ms: defaults::QUOTA_TTL_MS,
            marketing_ttl_ms: defaults::MARKETING_TTL_MS,
            progress_ttl_ms: defaults::PROGRESS_TTL_MS,
        }
    }
}

impl CacheConfig {
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub const fn task_list_ttl(&self) -> Duration {
        Duration::from_millis(self.task_list_ttl_ms)
    }

    pub const fn quota_ttl(&self) -> Duration {
        Duration::from_millis(self.quota_ttl_ms)
    }

    pub const fn marketing_ttl(&self) -> Duration {
        Duration::from_millis(self.marketing_ttl_ms)
    }

    pub const fn progress_ttl(&self) -> Duration {
        Duration::from_millis(self.progress_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub unchanged_threshold: u32,
    pub max_consecutive_failures: u32,
    pub analysis_step_type: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::POLL_INTERVAL_MS,
            unchanged_threshold: defaults::UNCHANGED_THRESHOLD,
            max_consecutive_failures: defaults::MAX_CONSECUTIVE_FAILURES,
            analysis_step_type: defaults::ANALYSIS_STEP_TYPE,
        }
    }
}

impl PollingConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub check_interval_ms: u64,
    pub max_wait_ms: u64,
    pub monitor_page_size: u32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: defaults::FLOW_CHECK_INTERVAL_MS,
            max_wait_ms: defaults::FLOW_MAX_WAIT_MS,
            monitor_page_size: defaults::FLOW_MONITOR_PAGE_SIZE,
        }
    }
}

impl FlowSettings {
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub page_size: u32,
    pub max_tasks: usize,
    pub auto_refresh_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            page_size: defaults::REGISTRY_PAGE_SIZE,
            max_tasks: defaults::REGISTRY_MAX_TASKS,
            auto_refresh_interval_ms: defaults::AUTO_REFRESH_INTERVAL_MS,
        }
    }
}

impl RegistryConfig {
    pub const fn auto_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.auto_refresh_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Local key-value store file. `None` resolves to the platform data dir;
    /// an empty path keeps the store in memory only.
    pub local_store_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_store_path(&self) -> Option<PathBuf> {
        match &self.local_store_path {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path.clone()),
            None => default_data_dir().map(|dir| dir.join("local_store.json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to `<data dir>/logs`
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Extra per-module directives, e.g. `"reqwest" = "warn"`
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: None,
            file_prefix: defaults::LOG_FILE_PREFIX.to_string(),
            module_filters: HashMap::new(),
        }
    }
}

/// `<local data dir>/taskflow-engine`
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME))
}

/// `<config dir>/taskflow-engine/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
}

impl EngineConfig {
    /// Loads defaults, then `path` (required when given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        info!("⚙️ Configuration loaded (base_url={})", config.api.base_url);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::Validation { message });

        if url::Url::parse(&self.api.base_url).is_err() {
            return fail(format!("api.base_url is not a valid URL: {}", self.api.base_url));
        }
        if self.gateway.timeout_ms == 0 {
            return fail("gateway.timeout_ms must be greater than 0".to_string());
        }
        if self.gateway.max_attempts == 0 {
            return fail("gateway.max_attempts must be at least 1".to_string());
        }
        if self.polling.interval_ms == 0 {
            return fail("polling.interval_ms must be greater than 0".to_string());
        }
        if self.polling.unchanged_threshold < MIN_UNCHANGED_THRESHOLD {
            return fail(format!(
                "polling.unchanged_threshold must be at least {MIN_UNCHANGED_THRESHOLD}"
            ));
        }
        if self.flow.check_interval_ms == 0 || self.flow.max_wait_ms == 0 {
            return fail("flow intervals must be greater than 0".to_string());
        }
        if self.flow.monitor_page_size == 0 || self.registry.page_size == 0 {
            return fail("page sizes must be greater than 0".to_string());
        }
        if self.registry.max_tasks == 0 {
            return fail("registry.max_tasks must be greater than 0".to_string());
        }
        if self.registry.auto_refresh_interval_ms == 0 {
            return fail("registry.auto_refresh_interval_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.gateway.min_interval(), Duration::from_secs(1));
        assert_eq!(config.gateway.timeout(), Duration::from_secs(30));
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.polling.interval(), Duration::from_secs(5));
        assert_eq!(config.polling.unchanged_threshold, 4);
        assert_eq!(config.flow.check_interval(), Duration::from_secs(30));
        assert_eq!(config.flow.max_wait(), Duration::from_secs(30 * 60));
        assert_eq!(config.registry.max_tasks, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[api]\nbase_url = \"https://api.example.com\"\n\n[polling]\ninterval_ms = 2500\n"
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api.base_url, "https://api.example.com");
        assert_eq!(config.polling.interval_ms, 2500);
        assert_eq!(config.polling.unchanged_threshold, defaults::UNCHANGED_THRESHOLD);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = EngineConfig::default();
        config.polling.unchanged_threshold = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Validation { .. })));

        let mut config = EngineConfig::default();
        config.api.base_url = "not a url".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.gateway.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_required_file_fails() {
        let result = EngineConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }

    #[test]
    fn empty_store_path_means_memory_only() {
        let storage = StorageConfig {
            local_store_path: Some(PathBuf::new()),
        };
        assert!(storage.resolve_store_path().is_none());
    }
}
