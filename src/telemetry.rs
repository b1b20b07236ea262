//! Shared telemetry bootstrap for shardlog binaries.
//!
//! Logging goes through `tracing` with a JSON or text formatter. Counters and
//! histograms are recorded through the `metrics` facade; a binary that wants
//! them exported installs a recorder of its choice; without one they are no-ops.

use crate::{Error, Result};

use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

static SERVICE: OnceLock<String> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Service label attached to every metric.
pub fn service() -> String {
    SERVICE.get().cloned().unwrap_or_else(|| "shardlog".to_string())
}

/// Run label attached to every metric, "none" outside a tagged run.
pub fn run_id() -> String {
    RUN_ID.get().cloned().unwrap_or_else(|| "none".to_string())
}

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    pub run_id: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name = std::env::var("SHARDLOG_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "SHARDLOG_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let log_format = match std::env::var("SHARDLOG_LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw)?,
            Err(_) => LogFormat::Json,
        };

        let run_id = std::env::var("SHARDLOG_RUN_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            service_name: service_name.to_string(),
            log_format,
            run_id,
        })
    }
}

/// Handle returned once the global subscriber is installed.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Install the global tracing subscriber for a binary.
    ///
    /// `log_level` is the default directive; `RUST_LOG` overrides it.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true);
        let installed = match config.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        let _ = SERVICE.set(config.service_name.clone());
        if let Some(run_id) = &config.run_id {
            let _ = RUN_ID.set(run_id.clone());
        }

        info!(
            service_name = %config.service_name,
            log_format = config.log_format.as_str(),
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry bootstrap initialized"
        );

        Ok(Self { config })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.config.run_id.as_deref()
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" | "pretty" => Ok(LogFormat::Text),
        other => Err(Error::Config(format!(
            "SHARDLOG_LOG_FORMAT must be one of [json, text], got '{other}'"
        ))),
    }
}

fn parse_log_level(raw: &str) -> Result<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_mixed_case() {
        assert_eq!(parse_log_level(" INFO ").unwrap(), "info");
        assert_eq!(parse_log_level("Debug").unwrap(), "debug");
    }

    #[test]
    fn parse_log_level_rejects_unknown_levels() {
        let err = parse_log_level("verbose").unwrap_err();
        assert!(format!("{err}").contains("invalid log level"));
    }

    #[test]
    fn parse_log_format_accepts_aliases() {
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert_eq!(parse_log_format("Pretty").unwrap(), LogFormat::Text);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn metric_labels_have_defaults() {
        assert!(!service().is_empty());
        assert!(!run_id().is_empty());
    }
}
