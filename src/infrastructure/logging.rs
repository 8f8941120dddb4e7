//! Logging system configuration and initialization
//!
//! This module provides the worker logging setup with:
//! - Console and file output support
//! - Configuration based log level control with `RUST_LOG` override
//! - Structured JSON logging (optional)
//! - Timestamps in a configurable UTC offset
//! - Startup cleanup of old log files

#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, anyhow};
use chrono::{FixedOffset, Offset, Utc};
use lazy_static::lazy_static;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Targets quieted unless trace is requested
const NOISY_TARGETS: &[(&str, &str)] = &[
    ("sqlx::query", "warn"),
    ("sqlx::sqlite", "warn"),
    ("reqwest", "info"),
    ("hyper", "warn"),
    ("h2", "warn"),
    ("redis", "warn"),
    ("tokio", "info"),
];

/// Timestamp formatter for a fixed UTC offset
#[derive(Clone, Copy)]
struct OffsetTimeFormatter {
    offset: FixedOffset,
}

impl OffsetTimeFormatter {
    fn new(hours: i32) -> Self {
        let offset = FixedOffset::east_opt(hours.clamp(-23, 23) * 3600).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }
}

impl FormatTime for OffsetTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Utc::now().with_timezone(&self.offset);
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Get the log directory relative to the executable location
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LoggingConfig::default())
}

/// Builds the filter: `RUST_LOG` wins, otherwise the configured level with
/// dependency noise suppressed unless the level is trace
fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(&config.level);

        if !config.level.to_lowercase().contains("trace") {
            for (target, level) in NOISY_TARGETS {
                if let Ok(directive) = format!("{target}={level}").parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        for (module, level) in &config.module_filters {
            match format!("{module}={level}").parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring invalid log filter {}={}: {}", module, level, e),
            }
        }

        filter
    })
}

/// Initialize logging with custom configuration
///
/// # Environment Variable Override
/// ```bash
/// # Show every store command and SQL statement
/// RUST_LOG="debug,redis=debug,sqlx::query=debug" cursor_seed 7 news 100
/// ```
pub fn init_logging_with_config(config: LoggingConfig) -> Result<()> {
    let timer = OffsetTimeFormatter::new(config.utc_offset_hours);
    let registry = Registry::default().with(build_env_filter(&config));
    let log_dir = config.directory.clone().unwrap_or_else(get_log_directory);

    match (config.file_output, config.console_output) {
        (true, console) => {
            std::fs::create_dir_all(&log_dir)
                .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;

            if config.auto_cleanup_logs {
                cleanup_old_logs(&log_dir, &config)?;
            }

            let file_appender = rolling::never(&log_dir, &config.file_name);
            let (file_writer, file_guard) = non_blocking(file_appender);

            // Store the guard globally to prevent it from being dropped
            LOG_GUARDS
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(file_guard);

            // Each branch builds its own console layer: the layer type is tied
            // to the subscriber stack beneath it
            if config.json_format {
                let file_layer = fmt::Layer::new()
                    .json()
                    .with_writer(file_writer)
                    .with_timer(timer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false);
                let console_layer = console.then(|| {
                    fmt::Layer::new()
                        .with_writer(std::io::stdout)
                        .with_timer(timer)
                        .with_target(false)
                });
                registry
                    .with(file_layer)
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| anyhow!("Failed to install subscriber: {}", e))?;
            } else {
                let file_layer = fmt::Layer::new()
                    .with_writer(file_writer)
                    .with_timer(timer)
                    .with_target(false)
                    .with_ansi(false);
                let console_layer = console.then(|| {
                    fmt::Layer::new()
                        .with_writer(std::io::stdout)
                        .with_timer(timer)
                        .with_target(false)
                });
                registry
                    .with(file_layer)
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| anyhow!("Failed to install subscriber: {}", e))?;
            }
        }
        (false, true) => {
            if config.json_format {
                let console_layer = fmt::Layer::new().json().with_timer(timer).with_target(true);
                registry
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| anyhow!("Failed to install subscriber: {}", e))?;
            } else {
                let console_layer = fmt::Layer::new()
                    .with_writer(std::io::stdout)
                    .with_timer(timer)
                    .with_target(false);
                registry
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| anyhow!("Failed to install subscriber: {}", e))?;
            }
        }
        (false, false) => {
            return Err(anyhow!("No logging output configured"));
        }
    }

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log file: {:?}", log_dir.join(&config.file_name));
    }
    Ok(())
}

/// Clean up old log files beyond `max_files`, newest kept
fn cleanup_old_logs(log_dir: &Path, config: &LoggingConfig) -> Result<usize> {
    let mut log_files = Vec::new();

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path.extension().is_some_and(|ext| ext == "log");
        if !path.is_file() || !is_log {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(config.max_files as usize) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove old log file {:?}: {}", path, e);
        } else {
            removed += 1;
        }
    }
    Ok(removed)
}
