//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG` (default `info`). Output is JSON unless
//! `CONVOY_LOG_FORMAT=pretty`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "CONVOY_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown log format '{0}' (expected json or pretty)")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(ParseLogFormatError(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

impl LogFormat {
    /// Format from `CONVOY_LOG_FORMAT`; unset or unrecognised values give JSON.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(ENV_LOG_FORMAT)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Initialize with an explicit output format.
pub fn init_with(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::from_lookup(|_| None), LogFormat::Json);
        assert_eq!(
            LogFormat::from_lookup(|_| Some("yaml".to_string())),
            LogFormat::Json
        );
    }

    #[test]
    fn pretty_is_selected_case_insensitively() {
        assert_eq!(
            LogFormat::from_lookup(|_| Some(" Pretty ".to_string())),
            LogFormat::Pretty
        );
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_is_idempotent() {
        init_with(LogFormat::Pretty);
        init_with(LogFormat::Json);
        ::tracing::info!("still logging after repeated init");
    }
}
