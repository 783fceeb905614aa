//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events. The CLI, benches and tests call
//! [`init_logging_from_env`] (or [`init_with_config`]) to install a subscriber.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full filter directive; overrides everything below
//! - `ZEFORGE_LOG_LEVEL`: level for the `zeforge` target (error .. trace)
//! - `ZEFORGE_LOG_FORMAT`: console output, `human` or `json`
//! - `ZEFORGE_LOG_FILE`: also append JSON events to this file

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static SUBSCRIBER: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "ZEFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "ZEFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "ZEFORGE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("invalid log format: {0}")]
    InvalidFormat(String),

    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Some other crate installed a global subscriber first
    #[error("global subscriber already set: {0}")]
    AlreadySet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for the `zeforge` target; dependencies stay at `warn`
    pub level: Level,
    pub format: LogFormat,
    /// Source file and line in console events
    pub with_file_info: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Human,
            with_file_info: false,
            log_file: None,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, enabled: bool) -> Self {
        self.with_file_info = enabled;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Read `ZEFORGE_LOG_*`. Unlike the CLI flags, a bad value is an error
    /// rather than a silent default.
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError> {
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.level = level
                .trim()
                .parse()
                .map_err(|_| LoggingError::InvalidLevel(level.clone()))?;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            self.format = format.parse()?;
        }
        if let Some(file) = lookup(LOG_FILE_ENV) {
            self = self.with_log_file(file);
        }
        Ok(self)
    }

    /// `RUST_LOG` when set, else `zeforge=<level>,warn`.
    fn filter(&self, rust_log: Option<String>) -> Result<EnvFilter, LoggingError> {
        let directive = rust_log.unwrap_or_else(|| {
            format!("zeforge={},zeforge_cli={},warn", self.level, self.level).to_lowercase()
        });
        EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
    }
}

/// Install a subscriber configured from the environment.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_with_config(&LoggingConfig::from_env()?)
}

/// Install a subscriber once per process.
///
/// Only the first call does anything; its result is returned to that caller
/// and later calls return `Ok`.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut result = Ok(());
    SUBSCRIBER.get_or_init(|| {
        result = install(config);
    });
    result
}

pub fn is_initialized() -> bool {
    SUBSCRIBER.get().is_some()
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = config.filter(std::env::var("RUST_LOG").ok())?;

    let console = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Human => fmt::layer()
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .boxed(),
    };

    let file = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(open_log_file(path)?)
                .with_ansi(false)
                .with_thread_names(true),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::AlreadySet(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let wrap = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    OpenOptions::new().create(true).append(true).open(path).map_err(wrap)
}
