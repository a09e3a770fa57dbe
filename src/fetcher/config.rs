//! Fetcher configuration.
//!
//! This module provides the knobs of the worker pool: pool size, the
//! per-attempt deadline, retry policy defaults, and sink/shutdown bounds.
//! Configuration can be built in code, read from `FETCHER_*` environment
//! variables, or loaded from a YAML file (durations in milliseconds).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::policy::DEFAULT_DECAY_FACTOR;
use super::task::DEFAULT_PRIORITY;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or field has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error while reading configuration.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for a [`Fetcher`](super::Fetcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Number of worker loops to spawn.
    pub num_workers: usize,
    /// Deadline for a single fetch attempt.
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    /// Priority given to locations added without one.
    pub default_priority: f64,
    /// Factor of the default multiplicative priority decay.
    pub decay_factor: f64,
    /// Fetch errors tolerated per task before it is dead-lettered.
    pub max_failures: u32,
    /// Total attempts per task before it is dead-lettered (None = unbounded).
    pub max_attempts: Option<u32>,
    /// How long to wait for a cancelled attempt to stop (None = unbounded).
    #[serde(rename = "settle_timeout_ms", with = "option_duration_millis")]
    pub settle_timeout: Option<Duration>,
    /// Maximum number of undrained results (None = unbounded).
    pub result_capacity: Option<usize>,
    /// Timeout for graceful shutdown.
    #[serde(rename = "shutdown_timeout_ms", with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            timeout: Duration::from_millis(100),
            default_priority: DEFAULT_PRIORITY,
            decay_factor: DEFAULT_DECAY_FACTOR,
            max_failures: 3,
            max_attempts: None,
            settle_timeout: None,
            result_capacity: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl FetcherConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FETCHER_NUM_WORKERS`: Pool size (default: 4)
    /// - `FETCHER_TIMEOUT_MS`: Per-attempt deadline in ms (default: 100)
    /// - `FETCHER_DEFAULT_PRIORITY`: Default priority (default: 0.5)
    /// - `FETCHER_DECAY_FACTOR`: Priority decay factor (default: 1.1)
    /// - `FETCHER_MAX_FAILURES`: Fetch errors per task (default: 3)
    /// - `FETCHER_MAX_ATTEMPTS`: Attempts per task (default: unbounded)
    /// - `FETCHER_SETTLE_TIMEOUT_MS`: Settle bound in ms (default: unbounded)
    /// - `FETCHER_RESULT_CAPACITY`: Result sink bound (default: unbounded)
    /// - `FETCHER_SHUTDOWN_TIMEOUT_MS`: Shutdown timeout in ms (default: 30000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable lookup.
    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("FETCHER_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "FETCHER_NUM_WORKERS")?;
        }

        if let Some(val) = lookup("FETCHER_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "FETCHER_TIMEOUT_MS")?;
            config.timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("FETCHER_DEFAULT_PRIORITY") {
            config.default_priority = parse_env_value(&val, "FETCHER_DEFAULT_PRIORITY")?;
        }

        if let Some(val) = lookup("FETCHER_DECAY_FACTOR") {
            config.decay_factor = parse_env_value(&val, "FETCHER_DECAY_FACTOR")?;
        }

        if let Some(val) = lookup("FETCHER_MAX_FAILURES") {
            config.max_failures = parse_env_value(&val, "FETCHER_MAX_FAILURES")?;
        }

        if let Some(val) = lookup("FETCHER_MAX_ATTEMPTS") {
            config.max_attempts = Some(parse_env_value(&val, "FETCHER_MAX_ATTEMPTS")?);
        }

        if let Some(val) = lookup("FETCHER_SETTLE_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "FETCHER_SETTLE_TIMEOUT_MS")?;
            config.settle_timeout = Some(Duration::from_millis(ms));
        }

        if let Some(val) = lookup("FETCHER_RESULT_CAPACITY") {
            config.result_capacity = Some(parse_env_value(&val, "FETCHER_RESULT_CAPACITY")?);
        }

        if let Some(val) = lookup("FETCHER_SHUTDOWN_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "FETCHER_SHUTDOWN_TIMEOUT_MS")?;
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file. Missing fields keep defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "timeout must be greater than 0".to_string(),
            ));
        }

        if !self.default_priority.is_finite() {
            return Err(ConfigError::ValidationFailed(
                "default_priority must be finite".to_string(),
            ));
        }

        if !self.decay_factor.is_finite() || self.decay_factor <= 1.0 {
            return Err(ConfigError::ValidationFailed(
                "decay_factor must be finite and greater than 1".to_string(),
            ));
        }

        if self.max_failures == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_failures must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0 when set".to_string(),
            ));
        }

        if self.settle_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "settle_timeout must be greater than 0 when set".to_string(),
            ));
        }

        if self.result_capacity == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "result_capacity must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the default priority.
    pub fn with_default_priority(mut self, priority: f64) -> Self {
        self.default_priority = priority;
        self
    }

    /// Sets the decay factor.
    pub fn with_decay_factor(mut self, factor: f64) -> Self {
        self.decay_factor = factor;
        self
    }

    /// Sets the fetch-error budget per task.
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Caps the total attempts per task.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Bounds the wait for a cancelled attempt to stop.
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = Some(timeout);
        self
    }

    /// Bounds the number of undrained results.
    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = Some(capacity);
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = FetcherConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.timeout, Duration::from_millis(100));
        assert!((config.default_priority - 0.5).abs() < f64::EPSILON);
        assert!((config.decay_factor - 1.1).abs() < f64::EPSILON);
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.settle_timeout, None);
        assert_eq!(config.result_capacity, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = FetcherConfig::new(2)
            .with_timeout(Duration::from_millis(250))
            .with_default_priority(0.7)
            .with_decay_factor(1.5)
            .with_max_failures(5)
            .with_max_attempts(10)
            .with_settle_timeout(Duration::from_secs(2))
            .with_result_capacity(64)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.num_workers, 2);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!((config.default_priority - 0.7).abs() < f64::EPSILON);
        assert!((config.decay_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.max_failures, 5);
        assert_eq!(config.max_attempts, Some(10));
        assert_eq!(config.settle_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.result_capacity, Some(64));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            FetcherConfig::new(0),
            FetcherConfig::default().with_timeout(Duration::ZERO),
            FetcherConfig::default().with_default_priority(f64::NAN),
            FetcherConfig::default().with_decay_factor(1.0),
            FetcherConfig::default().with_max_failures(0),
            FetcherConfig::default().with_max_attempts(0),
            FetcherConfig::default().with_settle_timeout(Duration::ZERO),
            FetcherConfig::default().with_result_capacity(0),
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::ValidationFailed(_))),
                "expected validation failure for {:?}",
                config
            );
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = FetcherConfig::from_lookup(lookup_from(&[
            ("FETCHER_NUM_WORKERS", "8"),
            ("FETCHER_TIMEOUT_MS", "1500"),
            ("FETCHER_MAX_ATTEMPTS", " 12 "),
            ("FETCHER_SETTLE_TIMEOUT_MS", "300"),
        ]))
        .expect("config should load");

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_attempts, Some(12));
        assert_eq!(config.settle_timeout, Some(Duration::from_millis(300)));
        assert_eq!(config.result_capacity, None);
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = FetcherConfig::from_lookup(lookup_from(&[("FETCHER_NUM_WORKERS", "many")]))
            .expect_err("should reject non-numeric value");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("FETCHER_NUM_WORKERS"));

        let err = FetcherConfig::from_lookup(lookup_from(&[("FETCHER_NUM_WORKERS", "0")]))
            .expect_err("should fail validation");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "num_workers: 2\ntimeout_ms: 250\nsettle_timeout_ms: 1000\nmax_failures: 1"
        )
        .expect("write config");

        let config = FetcherConfig::from_yaml_file(file.path()).expect("config should load");
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.settle_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.max_failures, 1);
        assert!((config.decay_factor - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_yaml_roundtrip_uses_milliseconds() {
        let config = FetcherConfig::new(3).with_timeout(Duration::from_millis(42));
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(yaml.contains("timeout_ms: 42"));
        assert!(yaml.contains("settle_timeout_ms: null"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "decay_factor".to_string(),
            message: "must be finite".to_string(),
        };
        assert!(err.to_string().contains("decay_factor"));

        let err = ConfigError::ValidationFailed("num_workers".to_string());
        assert!(err.to_string().contains("validation failed"));
    }
}
