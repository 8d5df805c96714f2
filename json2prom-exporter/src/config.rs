//! Configuration for the exporter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use json2prom_common::{ConfigFormat, LoggingConfig, load_config, parse_config};

use crate::http::{HEALTH_PATH, READY_PATH};
use crate::mapping::{
    TARGET_LABEL, is_valid_label_name, is_valid_metric_name, sanitize_label_name,
    sanitize_metric_name,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] json2prom_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterConfig {
    /// Endpoints to poll.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Prometheus exposition settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Series lifecycle settings.
    #[serde(default)]
    pub series: SeriesConfig,

    /// What to do when a target fails to initialize.
    #[serde(default)]
    pub target_errors: TargetErrorPolicy,

    /// Upper bound on draining pollers and the HTTP server at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_shutdown_grace() -> u64 {
    5
}

/// One JSON endpoint to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TargetConfig {
    /// Logical name, exported as the `target` label.
    pub name: String,

    /// Request URI.
    pub uri: String,

    /// HTTP method (default: "GET").
    #[serde(default = "default_method")]
    pub method: String,

    /// Send the externally supplied authorization value.
    #[serde(default)]
    pub include_auth_header: bool,

    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub use_bearer_token_from: Option<String>,

    /// Static headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Form-encoded body parameters; absent means no body.
    #[serde(default)]
    pub form_params: Option<BTreeMap<String, String>>,

    /// Poll interval in seconds.
    pub period_seconds: u64,

    /// Request timeout in seconds (default: the poll interval).
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Metrics extracted from each response.
    pub metrics: Vec<MetricConfig>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl TargetConfig {
    /// Poll interval.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(self.period_seconds))
    }
}

/// Extraction rule for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricConfig {
    /// Exported metric name.
    pub name: String,

    /// Query selecting the items (default: ".", the whole document).
    #[serde(default = "default_items_query")]
    pub items_query: String,

    /// Query selecting the numeric value of one item.
    pub value_query: String,

    /// Labels extracted from each item.
    #[serde(default)]
    pub labels: Vec<LabelConfig>,
}

fn default_items_query() -> String {
    ".".to_string()
}

/// A label and the query producing its value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelConfig {
    /// Label name.
    pub name: String,
    /// Query evaluated against one item.
    pub query: String,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9100").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Prefix of the exporter's own metrics (default: "json2prom").
    #[serde(default = "default_prefix")]
    pub self_metrics_prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "json2prom".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            self_metrics_prefix: default_prefix(),
        }
    }
}

/// Series lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesConfig {
    /// Cycles a series may go unrefreshed before it is retired (0 = retire
    /// as soon as a cycle does not report it).
    #[serde(default)]
    pub grace_cycles: u64,

    /// Maximum unique time series (memory protection).
    #[serde(default = "default_max_series")]
    pub max_series: usize,
}

fn default_max_series() -> usize {
    100_000
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            grace_cycles: 0,
            max_series: default_max_series(),
        }
    }
}

/// Startup policy for targets that fail to initialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetErrorPolicy {
    /// Log the failure and keep the other targets running.
    #[default]
    Skip,
    /// Refuse to start.
    Abort,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            prometheus: PrometheusConfig::default(),
            series: SeriesConfig::default(),
            target_errors: TargetErrorPolicy::default(),
            shutdown_grace_seconds: default_shutdown_grace(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Shutdown drain bound.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Load configuration from a JSON5 or YAML file (chosen by extension).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_as(content, ConfigFormat::Json5)
    }

    /// Parse configuration from a string in the given format.
    pub fn parse_as(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: ExporterConfig = parse_config(content, format)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Validation(
                "at least one target is required".to_string(),
            ));
        }

        let mut target_names = HashSet::new();
        for target in &self.targets {
            target.validate(&self.prometheus.self_metrics_prefix)?;
            if !target_names.insert(target.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
        }

        if self.series.max_series == 0 {
            return Err(ConfigError::Validation(
                "maxSeries must be > 0".to_string(),
            ));
        }

        // Validate listen address format
        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        // Validate path starts with /
        let path = self.prometheus.path.as_str();
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }
        if path == HEALTH_PATH || path == READY_PATH {
            return Err(ConfigError::Validation(format!(
                "Metrics path '{}' is reserved",
                path
            )));
        }
        // ':' and '*' open route captures; the metrics path must be literal.
        if path.contains([':', '*']) {
            return Err(ConfigError::Validation(format!(
                "Metrics path '{}' must not contain ':' or '*'",
                path
            )));
        }

        if !is_valid_metric_name(&self.prometheus.self_metrics_prefix) {
            return Err(ConfigError::Validation(format!(
                "invalid selfMetricsPrefix '{}'",
                self.prometheus.self_metrics_prefix
            )));
        }

        Ok(())
    }
}

impl TargetConfig {
    fn validate(&self, self_prefix: &str) -> Result<(), ConfigError> {
        let fail =
            |msg: String| ConfigError::Validation(format!("target '{}': {}", self.name, msg));

        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "target name must not be empty".to_string(),
            ));
        }
        if self.period_seconds == 0 {
            return Err(fail("periodSeconds must be > 0".to_string()));
        }
        if self.timeout_seconds == Some(0) {
            return Err(fail("timeoutSeconds must be > 0".to_string()));
        }
        if self.include_auth_header && self.use_bearer_token_from.is_some() {
            return Err(fail(
                "includeAuthHeader and useBearerTokenFrom are mutually exclusive".to_string(),
            ));
        }
        if self.metrics.is_empty() {
            return Err(fail("at least one metric is required".to_string()));
        }

        let mut metric_names = HashSet::new();
        for metric in &self.metrics {
            if !is_valid_metric_name(&metric.name) {
                return Err(fail(format!(
                    "invalid metric name '{}' (try '{}')",
                    metric.name,
                    sanitize_metric_name(&metric.name)
                )));
            }
            if metric.name == self_prefix
                || metric
                    .name
                    .strip_prefix(self_prefix)
                    .is_some_and(|rest| rest.starts_with('_'))
            {
                return Err(fail(format!(
                    "metric name '{}' collides with the exporter's own '{}_*' metrics",
                    metric.name, self_prefix
                )));
            }
            if !metric_names.insert(metric.name.as_str()) {
                return Err(fail(format!("duplicate metric name '{}'", metric.name)));
            }

            let mut label_names = HashSet::new();
            for label in &metric.labels {
                if label.name == TARGET_LABEL {
                    return Err(fail(format!(
                        "metric '{}': label name '{}' is reserved",
                        metric.name, TARGET_LABEL
                    )));
                }
                if !is_valid_label_name(&label.name) {
                    return Err(fail(format!(
                        "metric '{}': invalid label name '{}' (try '{}')",
                        metric.name,
                        label.name,
                        sanitize_label_name(&label.name)
                    )));
                }
                if !label_names.insert(label.name.as_str()) {
                    return Err(fail(format!(
                        "metric '{}': duplicate label name '{}'",
                        metric.name, label.name
                    )));
                }
            }
        }

        Ok(())
    }
}
