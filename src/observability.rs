//! Logging setup for the batch binary plus the run lifecycle events.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_VAR: &str = "DELAYCAST_LOG_LEVEL";
pub const LOG_FORMAT_VAR: &str = "DELAYCAST_LOG_FORMAT";
pub const LOG_TARGET_VAR: &str = "DELAYCAST_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `delaycast=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Builds a config from a variable lookup. Blank or unrecognized values
    /// keep the default for that setting.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup(LOG_LEVEL_VAR) {
            let level = level.trim();
            if !level.is_empty() {
                config.level = level.to_string();
            }
        }
        if let Some(format) = lookup(LOG_FORMAT_VAR).as_deref().and_then(LogFormat::parse) {
            config.format = format;
        }
        if let Some(include_target) = lookup(LOG_TARGET_VAR).as_deref().and_then(parse_switch) {
            config.include_target = include_target;
        }

        config
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("invalid log filter '{directive}': {source}")]
    InvalidFilter {
        directive: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    LoggingConfig::from_lookup(|key| env::var(key).ok())
}

/// Installs the global subscriber. A filter directive that does not parse is
/// an error rather than a silent fallback.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config)?)
        .with_target(config.include_target)
        .with_ansi(config.format != LogFormat::Json);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }

    Ok(())
}

pub fn log_run_start(config: &LoggingConfig, input: &Path, output_dir: &Path) {
    info!(
        component = "delay_pipeline",
        event = "run.start",
        log_level = %config.level,
        log_format = ?config.format,
        input = %input.display(),
        output_dir = %output_dir.display()
    );
}

/// `source` is `file` when `DELAYCAST_CONFIG` names a file, else `default`.
pub fn log_config_source(source: &str, path: Option<&Path>) {
    match path {
        Some(path) => info!(
            component = "delay_pipeline",
            event = "config.selected",
            source,
            path = %path.display()
        ),
        None => info!(
            component = "delay_pipeline",
            event = "config.selected",
            source
        ),
    }
}

pub fn log_run_finish(blocks: usize, evaluated_records: u64, artifacts: &[&Path]) {
    let artifacts: Vec<String> = artifacts
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    info!(
        component = "delay_pipeline",
        event = "run.finish",
        blocks,
        evaluated_records,
        artifacts = ?artifacts
    );
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingInitError> {
    EnvFilter::try_new(&config.level).map_err(|source| LoggingInitError::InvalidFilter {
        directive: config.level.clone(),
        source,
    })
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
