//! Logging initialisation.
//!
//! The binary calls [`init_telemetry`] once at startup. Library crates only
//! emit `tracing` events and never install a subscriber themselves.

#[cfg(feature = "telemetry")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ConveyorResult;
use serde::{Deserialize, Serialize};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Fallback filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Log line format.
    #[serde(default)]
    pub format: LogFormat,

    /// Whether to enable console output.
    #[serde(default = "default_console_output")]
    pub console_output: bool,
}

fn default_service_name() -> String {
    "conveyor".to_string()
}

fn default_filter() -> String {
    "info,conveyor=debug,tower_http=debug".to_string()
}

fn default_console_output() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            filter: default_filter(),
            format: LogFormat::default(),
            console_output: default_console_output(),
        }
    }
}

/// Install the global `tracing` subscriber.
#[cfg(feature = "telemetry")]
pub fn init_telemetry(config: &TelemetryConfig) -> ConveyorResult<()> {
    if !config.console_output {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    };

    result.map_err(|e| crate::ConveyorError::Internal(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );

    Ok(())
}

/// Placeholder for when telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn init_telemetry(_config: &TelemetryConfig) -> ConveyorResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "conveyor");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.console_output);
        assert!(config.filter.contains("conveyor=debug"));
    }

    #[test]
    fn test_format_deserialization() {
        let config: TelemetryConfig =
            serde_json::from_str(r#"{"format": "json", "console_output": false}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.console_output);
        assert_eq!(config.service_name, "conveyor");
    }
}
