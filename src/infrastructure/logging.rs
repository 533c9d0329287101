//! Logging system configuration and initialization
//!
//! - Console output and/or daily-rolling file output
//! - Optional structured JSON lines for the file sink
//! - Timestamps rendered in China Standard Time (UTC+8), the backend's zone
//! - `RUST_LOG` overrides the configured level entirely

use anyhow::{Context, Result, anyhow};
use chrono::{FixedOffset, Utc};
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;
use crate::infrastructure::config::default_data_dir;

const CST_OFFSET_SECS: i32 = 8 * 3600;

// Keeps the non-blocking file writer flushing for the life of the process
static LOG_GUARDS: Lazy<Mutex<Vec<WorkerGuard>>> = Lazy::new(|| Mutex::new(Vec::new()));

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Custom time formatter for CST (UTC+8)
struct CstTimeFormatter;

impl FormatTime for CstTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let offset = FixedOffset::east_opt(CST_OFFSET_SECS).ok_or(std::fmt::Error)?;
        let now = Utc::now().with_timezone(&offset);
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Configured log dir, else `<data dir>/logs`, else `./logs`.
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    config
        .log_dir
        .clone()
        .or_else(|| default_data_dir().map(|dir| dir.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Builds the filter used when `RUST_LOG` is unset.
///
/// HTTP stack internals are held at warn unless the configured level is
/// trace; entries in `module_filters` are appended last and win.
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    if !config.level.eq_ignore_ascii_case("trace") {
        for directive in ["reqwest=warn", "hyper=warn", "hyper_util=warn", "h2=warn", "tokio=info"] {
            filter = filter.add_directive(directive.parse()?);
        }
        filter = filter.add_directive(format!("taskflow_engine={}", config.level).parse()?);
    }

    for (module, level) in &config.module_filters {
        let directive = format!("{module}={level}");
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("invalid module filter '{directive}'"))?,
        );
    }

    Ok(filter)
}

/// Initialize logging with custom configuration.
///
/// Fails instead of panicking if a global subscriber is already installed.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if !config.console_output && !config.file_output {
        return Err(anyhow!("No logging output configured"));
    }

    let env_filter = build_env_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let log_dir = get_log_directory(config);
    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let appender = rolling::daily(&log_dir, &config.file_prefix);
        let (writer, guard) = non_blocking(appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("log guard registry poisoned"))?
            .push(guard);

        let file_layer: BoxedLayer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_timer(CstTimeFormatter)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_timer(CstTimeFormatter)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_timer(CstTimeFormatter)
                .with_target(false)
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;

    info!("📝 Logging initialized (level={}, json={})", config.level, config.json_format);
    if config.file_output {
        info!("📁 Log directory: {}", log_dir.display());
    }
    Ok(())
}
