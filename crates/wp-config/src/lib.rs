//! Waypoint configuration
//!
//! Simple key/value settings consumed when pools, policies and the router are
//! constructed. Values come from a TOML file, then `WAYPOINT_*` environment
//! variables override individual keys.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Telemetry window sizes for a single queue route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub latency_sample_size: usize,
    pub failure_sample_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            latency_sample_size: 10,
            failure_sample_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Cancel surplus idle routes once the pool has drained all work
    pub trim_idle_queues: bool,
    pub queue: QueueSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            trim_idle_queues: true,
            queue: QueueSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuingPolicyKind {
    Static,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuingPolicySettings {
    pub kind: QueuingPolicyKind,
    /// Creation is always approved below this many routes
    pub min_queue_count: usize,
    /// Creation is always denied at or above this many routes.
    /// Defaults to the available parallelism of the host.
    pub max_queue_count: Option<usize>,
    pub cpu_threshold_percent: f32,
    pub cpu_sample_size: usize,
}

impl QueuingPolicySettings {
    pub fn effective_max_queue_count(&self) -> usize {
        self.max_queue_count.unwrap_or_else(default_parallelism)
    }
}

impl Default for QueuingPolicySettings {
    fn default() -> Self {
        Self {
            kind: QueuingPolicyKind::Static,
            min_queue_count: 1,
            max_queue_count: None,
            cpu_threshold_percent: 80.0,
            cpu_sample_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    BoundedRetry,
    NoRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicySettings {
    pub kind: FailurePolicyKind,
    pub max_attempts: u32,
    pub wait_ms: u64,
    /// Sleep inside the routing stage instead of scheduling the resend
    pub block_queue: bool,
}

impl FailurePolicySettings {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

impl Default for FailurePolicySettings {
    fn default() -> Self {
        Self {
            kind: FailurePolicyKind::BoundedRetry,
            max_attempts: 3,
            wait_ms: 1000,
            block_queue: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Upper bound on concurrent workers resolving routing configuration
    pub pending_pool_max_queues: Option<usize>,
}

impl RouterSettings {
    pub fn effective_pending_pool_max_queues(&self) -> usize {
        self.pending_pool_max_queues.unwrap_or_else(default_parallelism)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub telemetry_interval_secs: u64,
    pub health_interval_secs: u64,
    pub open_request_warning_threshold: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            telemetry_interval_secs: 60,
            health_interval_secs: 60,
            open_request_warning_threshold: 10_000,
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointConfig {
    pub pool: PoolSettings,
    pub queuing_policy: QueuingPolicySettings,
    pub failure_policy: FailurePolicySettings,
    pub router: RouterSettings,
    pub lifecycle: LifecycleSettings,
}

impl WaypointConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&content)
    }

    /// Load from `path` when given, otherwise defaults, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WAYPOINT_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WAYPOINT_MIN_QUEUE_COUNT") {
            self.queuing_policy.min_queue_count = parse("WAYPOINT_MIN_QUEUE_COUNT", &v)?;
        }
        if let Some(v) = lookup("WAYPOINT_MAX_QUEUE_COUNT") {
            self.queuing_policy.max_queue_count = Some(parse("WAYPOINT_MAX_QUEUE_COUNT", &v)?);
        }
        if let Some(v) = lookup("WAYPOINT_CPU_THRESHOLD_PERCENT") {
            self.queuing_policy.cpu_threshold_percent = parse("WAYPOINT_CPU_THRESHOLD_PERCENT", &v)?;
        }
        if let Some(v) = lookup("WAYPOINT_MAX_ATTEMPTS") {
            self.failure_policy.max_attempts = parse("WAYPOINT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("WAYPOINT_RETRY_WAIT_MS") {
            self.failure_policy.wait_ms = parse("WAYPOINT_RETRY_WAIT_MS", &v)?;
        }
        if let Some(v) = lookup("WAYPOINT_BLOCK_QUEUE") {
            self.failure_policy.block_queue = parse("WAYPOINT_BLOCK_QUEUE", &v)?;
        }
        if let Some(v) = lookup("WAYPOINT_TRIM_IDLE_QUEUES") {
            self.pool.trim_idle_queues = parse("WAYPOINT_TRIM_IDLE_QUEUES", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let policy = &self.queuing_policy;
        if policy.min_queue_count == 0 {
            return Err(ConfigError::invalid("queuing_policy.min_queue_count", "must be at least 1"));
        }
        if policy.effective_max_queue_count() < policy.min_queue_count {
            return Err(ConfigError::invalid(
                "queuing_policy.max_queue_count",
                format!(
                    "must be >= min_queue_count ({})",
                    policy.min_queue_count
                ),
            ));
        }
        if !(0.0..=100.0).contains(&policy.cpu_threshold_percent) {
            return Err(ConfigError::invalid(
                "queuing_policy.cpu_threshold_percent",
                "must be between 0 and 100",
            ));
        }
        if policy.cpu_sample_size == 0 {
            return Err(ConfigError::invalid("queuing_policy.cpu_sample_size", "must be at least 1"));
        }
        if self.pool.queue.latency_sample_size == 0 || self.pool.queue.failure_sample_size == 0 {
            return Err(ConfigError::invalid("pool.queue", "sample sizes must be at least 1"));
        }
        if self.lifecycle.telemetry_interval_secs == 0 {
            return Err(ConfigError::invalid("lifecycle.telemetry_interval_secs", "must be at least 1"));
        }
        if self.lifecycle.health_interval_secs == 0 {
            return Err(ConfigError::invalid("lifecycle.health_interval_secs", "must be at least 1"));
        }
        if self.failure_policy.kind == FailurePolicyKind::BoundedRetry
            && self.failure_policy.max_attempts == 0
        {
            return Err(ConfigError::invalid("failure_policy.max_attempts", "must be at least 1"));
        }
        if self.failure_policy.block_queue && self.failure_policy.wait_ms > 60_000 {
            warn!(
                wait_ms = self.failure_policy.wait_ms,
                "Blocking retry wait over one minute will stall the routing stage"
            );
        }
        Ok(())
    }
}

fn parse<V: std::str::FromStr>(key: &str, value: &str) -> Result<V> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("cannot parse '{}'", value)))
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WaypointConfig::default();
        assert_eq!(config.pool.queue.latency_sample_size, 10);
        assert_eq!(config.pool.queue.failure_sample_size, 100);
        assert_eq!(config.failure_policy.max_attempts, 3);
        assert_eq!(config.queuing_policy.kind, QueuingPolicyKind::Static);
        assert!(config.queuing_policy.effective_max_queue_count() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = WaypointConfig::from_toml_str(
            r#"
            [queuing_policy]
            kind = "resource"
            max_queue_count = 8
            cpu_threshold_percent = 65.0

            [failure_policy]
            kind = "no_retry"
            block_queue = true

            [pool.queue]
            failure_sample_size = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.queuing_policy.kind, QueuingPolicyKind::Resource);
        assert_eq!(config.queuing_policy.effective_max_queue_count(), 8);
        assert_eq!(config.queuing_policy.min_queue_count, 1);
        assert_eq!(config.failure_policy.kind, FailurePolicyKind::NoRetry);
        assert!(config.failure_policy.block_queue);
        assert_eq!(config.pool.queue.failure_sample_size, 50);
        assert_eq!(config.pool.queue.latency_sample_size, 10);
        assert!(config.pool.trim_idle_queues);
    }

    #[test]
    fn test_rejects_max_below_min() {
        let err = WaypointConfig::from_toml_str(
            r#"
            [queuing_policy]
            min_queue_count = 4
            max_queue_count = 2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "queuing_policy.max_queue_count"));
    }

    #[test]
    fn test_rejects_zero_lifecycle_intervals() {
        let mut config = WaypointConfig::default();
        config.lifecycle.telemetry_interval_secs = 0;
        match config.validate() {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "lifecycle.telemetry_interval_secs"),
            other => panic!("expected invalid telemetry interval, got {other:?}"),
        }

        let mut config = WaypointConfig::default();
        config.lifecycle.health_interval_secs = 0;
        match config.validate() {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "lifecycle.health_interval_secs"),
            other => panic!("expected invalid health interval, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_policy_kind() {
        let err = WaypointConfig::from_toml_str("[failure_policy]\nkind = \"forever\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("WAYPOINT_MAX_QUEUE_COUNT", "3"),
            ("WAYPOINT_MAX_ATTEMPTS", "5"),
            ("WAYPOINT_BLOCK_QUEUE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = WaypointConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.queuing_policy.max_queue_count, Some(3));
        assert_eq!(config.failure_policy.max_attempts, 5);
        assert!(config.failure_policy.block_queue);
        assert_eq!(config.failure_policy.wait(), Duration::from_millis(1000));
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut config = WaypointConfig::default();
        let err = config
            .apply_overrides(|key| (key == "WAYPOINT_MAX_ATTEMPTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WAYPOINT_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lifecycle]\ntelemetry_interval_secs = 5").unwrap();

        let config = WaypointConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.lifecycle.telemetry_interval_secs, 5);
        assert_eq!(config.lifecycle.health_interval_secs, 60);
    }

    #[test]
    fn test_missing_file() {
        let err = WaypointConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
