use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use rosette_actions::{ActionExecutor, ExecutorConfig};
use rosette_lifecycle::Services;
use rosette_params::ParameterStore;
use rosette_transforms::{TransformGraph, DEFAULT_VALIDITY_WINDOW_MS};
use serde::{Deserialize, Serialize};
use shared_logging::{FanoutSink, JsonLogger, MemorySink, SharedSink, TracingSink};
use shared_message_bus::MessageBus;

use crate::nodes::{HEARTBEAT_PERIOD_KEY, MONITOR_PERIOD_KEY};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Transform buffer settings.
    pub transforms: TransformSettings,
    /// Action executor settings.
    pub actions: ActionSettings,
    /// Node lifecycle settings.
    pub lifecycle: LifecycleSettings,
    /// Diagnostics destinations.
    pub logging: LoggingSettings,
    /// Built-in node periods.
    pub nodes: NodeSettings,
    /// Free-form table seeded into the parameter store.
    pub parameters: toml::Table,
}

/// `[transforms]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    /// Maximum transform age usable by a lookup.
    pub validity_window_ms: i64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            validity_window_ms: DEFAULT_VALIDITY_WINDOW_MS,
        }
    }
}

impl TransformSettings {
    /// Validity window as a duration; rejects negative or out-of-range values.
    pub fn validity_window(&self) -> Result<chrono::Duration> {
        let ms = self.validity_window_ms;
        if ms < 0 {
            bail!("transforms.validity_window_ms must not be negative, got {ms}");
        }
        chrono::Duration::try_milliseconds(ms)
            .with_context(|| format!("transforms.validity_window_ms out of range: {ms}"))
    }
}

/// `[actions]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionSettings {
    /// How long terminal goal statuses stay queryable.
    pub completed_retention_ms: u64,
    /// Optional cap on simultaneously active goals.
    pub max_concurrent_goals: Option<usize>,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            completed_retention_ms: 30_000,
            max_concurrent_goals: None,
        }
    }
}

/// `[lifecycle]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// How long `stop` waits for a run loop.
    pub stop_timeout_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5_000,
        }
    }
}

impl LifecycleSettings {
    /// Stop timeout as a duration.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// JSON-lines diagnostics file, if any.
    pub json_log_path: Option<String>,
    /// Records kept in memory for the shutdown summary.
    pub memory_capacity: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            json_log_path: None,
            memory_capacity: 512,
        }
    }
}

/// `[nodes]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Heartbeat publication period.
    pub heartbeat_period_ms: u64,
    /// Topic monitor report period.
    pub monitor_report_period_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: 1_000,
            monitor_report_period_ms: 5_000,
        }
    }
}

impl SystemConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Diagnostics fanout: `tracing`, the in-memory ring, and the optional
    /// JSON-lines file.
    pub fn build_diagnostics(&self, memory: Arc<MemorySink>) -> Result<SharedSink> {
        let mut fanout = FanoutSink::new().with(Arc::new(TracingSink)).with(memory);
        if let Some(path) = &self.logging.json_log_path {
            let logger =
                JsonLogger::new(path).with_context(|| format!("opening diagnostics log {path}"))?;
            fanout = fanout.with(Arc::new(logger));
        }
        Ok(Arc::new(fanout))
    }

    /// Constructs every shared service and seeds the parameter store.
    ///
    /// `[nodes]` periods are written under `nodes/...` unless `[parameters]`
    /// already set them.
    pub fn build_services(&self, diagnostics: SharedSink) -> Result<Services> {
        let params = ParameterStore::new();
        params
            .load_table(&self.parameters, "")
            .context("seeding parameters")?;
        for (key, value) in [
            (HEARTBEAT_PERIOD_KEY, self.nodes.heartbeat_period_ms),
            (MONITOR_PERIOD_KEY, self.nodes.monitor_report_period_ms),
        ] {
            if !params.has(key) {
                params.set(key, i64::try_from(value).unwrap_or(i64::MAX));
            }
        }

        let transforms = TransformGraph::with_validity_window(self.transforms.validity_window()?);
        let actions = ActionExecutor::new(
            ExecutorConfig {
                completed_retention: Duration::from_millis(self.actions.completed_retention_ms),
                max_concurrent_goals: self.actions.max_concurrent_goals,
            },
            Arc::clone(&diagnostics),
        );

        Ok(Services {
            bus: MessageBus::new(Arc::clone(&diagnostics)),
            params,
            transforms,
            actions,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_logging::NullSink;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[transforms]
validity_window_ms = 2500

[actions]
max_concurrent_goals = 4

[lifecycle]
stop_timeout_ms = 750

[nodes]
heartbeat_period_ms = 200

[parameters]
robot = { name = "rover", wheel_base = 0.42 }

[parameters.nodes]
monitor_report_period_ms = 1234
"#;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = SystemConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.lifecycle.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.transforms.validity_window_ms, 10_000);
    }

    #[test]
    fn parses_sections_and_keeps_defaults() {
        let config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.transforms.validity_window_ms, 2_500);
        assert_eq!(config.actions.max_concurrent_goals, Some(4));
        assert_eq!(config.actions.completed_retention_ms, 30_000);
        assert_eq!(config.lifecycle.stop_timeout(), Duration::from_millis(750));
        assert_eq!(config.nodes.monitor_report_period_ms, 5_000);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[actions\nmax_concurrent_goals = ").unwrap();
        let err = SystemConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }

    #[test]
    fn services_are_seeded_from_config() {
        let config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        let services = config.build_services(Arc::new(NullSink)).unwrap();
        assert_eq!(services.params.get("robot/name", String::new()), "rover");
        assert!((services.params.get("robot/wheel_base", 0.0_f64) - 0.42).abs() < 1e-12);
        assert_eq!(services.params.get(HEARTBEAT_PERIOD_KEY, 0_u64), 200);
        // [parameters] wins over [nodes]
        assert_eq!(services.params.get(MONITOR_PERIOD_KEY, 0_u64), 1_234);
        assert_eq!(
            services.transforms.validity_window(),
            chrono::Duration::milliseconds(2_500)
        );
        assert_eq!(services.actions.config().max_concurrent_goals, Some(4));
    }

    #[test]
    fn unusable_validity_window_is_a_config_error() {
        for window in [i64::MIN, -1] {
            let config = SystemConfig::from_toml_str(&format!(
                "[transforms]\nvalidity_window_ms = {window}\n"
            ))
            .unwrap();
            let err = config.build_services(Arc::new(NullSink)).unwrap_err();
            assert!(
                format!("{err:#}").contains("validity_window_ms"),
                "window {window}: {err:#}"
            );
        }
    }

    #[test]
    fn json_log_is_part_of_fanout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/diag.jsonl");
        let config = SystemConfig {
            logging: LoggingSettings {
                json_log_path: Some(path.display().to_string()),
                memory_capacity: 8,
            },
            ..SystemConfig::default()
        };
        let memory = Arc::new(MemorySink::new(8));
        let sink = config.build_diagnostics(Arc::clone(&memory)).unwrap();
        shared_logging::DiagnosticSinkExt::record(
            sink.as_ref(),
            "test",
            shared_logging::LogLevel::Info,
            "wired",
            serde_json::json!({}),
        );
        assert!(memory.contains("wired"));
        assert!(fs::read_to_string(path).unwrap().contains("\"wired\""));
    }
}
