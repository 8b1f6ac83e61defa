// Logging setup for the worker binary

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither RUST_LOG nor LOG_LEVEL is set
pub const DEFAULT_LOG_FILTER: &str = "info,keel_durable=debug,keel_worker=debug";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "keel_durable=debug")
    pub log_filter: Option<String>,
    /// Include event targets in log lines
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "keel-worker".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `SERVICE_NAME`: service name (default: "keel-worker")
    /// - `RUST_LOG` or `LOG_LEVEL`: log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "keel-worker".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ..Default::default()
        }
    }

    /// Filter to install, falling back to [`DEFAULT_LOG_FILTER`] when unset or invalid
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Install the global tracing subscriber
///
/// Later calls are ignored, so tests and the binary can both call it.
pub fn init_telemetry(config: TelemetryConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.env_filter());

    if tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
    {
        tracing::info!(service = %config.service_name, "telemetry initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let config = TelemetryConfig::default();
        assert_eq!(config.env_filter().to_string(), EnvFilter::new(DEFAULT_LOG_FILTER).to_string());
    }

    #[test]
    fn test_explicit_filter() {
        let config = TelemetryConfig {
            log_filter: Some("warn".to_string()),
            ..Default::default()
        };
        assert_eq!(config.env_filter().to_string(), EnvFilter::new("warn").to_string());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_telemetry(TelemetryConfig::default());
        init_telemetry(TelemetryConfig::default());
    }
}
