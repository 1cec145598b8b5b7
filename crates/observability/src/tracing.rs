//! Tracing subscriber installation.
//!
//! Library crates only emit spans and events; installing the subscriber is
//! left to the process, through one of the functions below. Every variant is
//! idempotent: once a global subscriber exists, later calls do nothing.

use std::env;

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the output format (`json` or `text`).
pub const FORMAT_ENV: &str = "LEDGERFLOW_LOG_FORMAT";

const DEFAULT_DIRECTIVES: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human readable lines.
    Text,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "text" | "pretty" | "plain" => Some(Self::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info,ledgerflow_storage=debug`.
    pub directives: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directives: DEFAULT_DIRECTIVES.to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Read `RUST_LOG` and [`FORMAT_ENV`], falling back to defaults for
    /// anything missing or unrecognised.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            directives: env::var(EnvFilter::DEFAULT_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.directives),
            format: env::var(FORMAT_ENV)
                .ok()
                .and_then(|value| LogFormat::parse(&value))
                .unwrap_or(defaults.format),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
    }
}

/// Install the subscriber configured from the environment.
pub fn init() {
    init_with(&LoggingConfig::from_env());
}

pub fn init_with(config: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(true);

    let _ = match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

/// Text output captured by the test harness, honouring `RUST_LOG`.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(LoggingConfig::from_env().filter())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn invalid_directives_fall_back_to_info() {
        let config = LoggingConfig {
            directives: "ledgerflow=loudest".to_string(),
            format: LogFormat::Text,
        };
        assert_eq!(config.filter().to_string(), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_for_tests();
        init_with(&LoggingConfig::default());
        init();
    }
}
