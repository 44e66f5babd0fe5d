//! WoM Logging
//!
//! `tracing-subscriber` initialization shared by every WoM binary and test
//! harness. `RUST_LOG` takes precedence over the configured level.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log directive: {0}")]
    InvalidDirective(String),
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging section of the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Extra `target=level` directives, e.g. `wom_reconciler=debug`.
    pub directives: Vec<String>,
}

impl LoggingConfig {
    /// Build the filter. `RUST_LOG` replaces the configured level when set.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let base = std::env::var("RUST_LOG").unwrap_or_else(|_| self.level.as_str().to_string());
        let mut filter = EnvFilter::new(base);
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|_| LoggingError::InvalidDirective(directive.clone()))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install a pretty subscriber at `level`.
pub fn try_init(level: LogLevel) -> Result<(), LoggingError> {
    try_init_with(&LoggingConfig {
        level,
        ..LoggingConfig::default()
    })
}

/// Install the global subscriber described by `config`.
pub fn try_init_with(config: &LoggingConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(config.env_filter()?);
    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
