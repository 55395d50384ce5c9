use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default directive. Overridden by RUST_LOG.
    pub log_level: String,
    /// Per-module overrides, e.g. ("loom_server", DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }
}

/// Held for the life of the process.
pub struct TelemetryGuard {
    filter: String,
}

impl TelemetryGuard {
    /// The directive string the subscriber was built from.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Filter directive for `config`, ignoring RUST_LOG.
pub fn filter_directive(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.trim().to_lowercase();
    if filter.is_empty() {
        filter.push_str("info");
    }
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, writing to stderr. Call once at startup;
/// later calls are no-ops.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let directive = filter_directive(config);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true)
            .with_filter(build_filter(&directive))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(build_filter(&directive))
            .boxed()
    };

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("telemetry already initialized");
    }

    TelemetryGuard { filter: directive }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_includes_module_levels() {
        let config = TelemetryConfig::default()
            .with_module_level("loom_server", Level::DEBUG)
            .with_module_level("loom_store", Level::WARN);
        assert_eq!(filter_directive(&config), "info,loom_server=debug,loom_store=warn");
    }

    #[test]
    fn blank_level_defaults_to_info() {
        let config = TelemetryConfig {
            log_level: "  ".into(),
            ..TelemetryConfig::default()
        };
        assert_eq!(filter_directive(&config), "info");
    }

    #[test]
    fn bad_directive_falls_back() {
        // Must not panic on garbage input.
        let _ = build_filter("loom_server=notalevel");
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = TelemetryConfig::default();
        let first = init_telemetry(&config);
        let second = init_telemetry(&config);
        assert_eq!(first.filter(), second.filter());
        assert_eq!(first.filter(), "info");
    }
}
