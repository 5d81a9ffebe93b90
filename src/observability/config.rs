//! Observability configuration from YAML, with `${ENV_VAR}` substitution.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::ConfigError;
use crate::prelude::*;

/// Where a signal class is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTarget {
    ErrorTracker,
    MetricsTracker,
    Both,
}

impl SignalTarget {
    pub fn includes_error_tracker(&self) -> bool {
        matches!(self, SignalTarget::ErrorTracker | SignalTarget::Both)
    }

    pub fn includes_metrics_tracker(&self) -> bool {
        matches!(self, SignalTarget::MetricsTracker | SignalTarget::Both)
    }
}

/// Per-signal routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub errors: SignalTarget,
    pub metrics: SignalTarget,
    pub traces: SignalTarget,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            errors: SignalTarget::ErrorTracker,
            metrics: SignalTarget::MetricsTracker,
            traces: SignalTarget::MetricsTracker,
        }
    }
}

/// Error-tracker backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTrackerSettings {
    pub enabled: bool,
    pub dsn: Option<String>,
    pub environment: String,
    pub release: Option<String>,
    pub traces_sample_rate: f64,
    pub send_default_pii: bool,
}

impl Default for ErrorTrackerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dsn: None,
            environment: "development".into(),
            release: None,
            traces_sample_rate: 0.1,
            send_default_pii: false,
        }
    }
}

/// Metrics/traces backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsTrackerSettings {
    pub enabled: bool,
    pub service_name: String,
    pub endpoint: Option<String>,
    pub metrics_enabled: bool,
    pub traces_enabled: bool,
}

impl Default for MetricsTrackerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "question-forge".into(),
            endpoint: None,
            metrics_enabled: true,
            traces_enabled: true,
        }
    }
}

/// Root observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub error_tracker: ErrorTrackerSettings,
    pub metrics_tracker: MetricsTrackerSettings,
    pub routing: RoutingSettings,
}

impl ObservabilitySettings {
    /// Load from YAML. A missing path yields the defaults so observability
    /// is never a hard requirement for a run.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_owned()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        let mut value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        substitute_env_vars(&mut value);
        let settings: ObservabilitySettings = serde_yaml::from_value(value)?;
        Ok(settings)
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"))
}

/// Replace `${VAR}` in every string value with the environment variable's
/// value (or the empty string when unset). Keys are left untouched.
fn substitute_env_vars(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                let replaced = env_pattern().replace_all(s, |caps: &regex::Captures| {
                    std::env::var(&caps[1]).unwrap_or_default()
                });
                *s = replaced.into_owned();
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env_vars(v);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_env_vars(v);
            }
        }
        _ => {}
    }
}
