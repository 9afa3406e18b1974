//! Logging configuration for fifoesque hosts.
//!
//! The state machine itself only emits `tracing` events; a host embedding
//! it (a replica process, a test harness) calls [`init_logging`] once at
//! startup to install a subscriber.
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: Set to `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: Control log levels (default: `info`)

use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty-print format (default).
    #[default]
    Pretty,
    /// JSON format for log aggregators (Elasticsearch, Loki, etc.).
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from the LOG_FORMAT environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Initialize logging with the specified format.
///
/// Sets up the tracing subscriber with either JSON or pretty-print
/// output. Log levels are controlled via the `RUST_LOG` environment
/// variable.
///
/// Note: JSON logging requires the `json` feature on tracing-subscriber.
/// Without it, JSON format falls back to pretty format with a warning.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
            tracing::warn!(
                "JSON logging requested but json feature not enabled, using pretty format"
            );
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("anything".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_debug() {
        assert!(format!("{:?}", LogFormat::Json).contains("Json"));
    }
}
