/*!
 * Configuration types for Tollgate
 */

use crate::error::{Result, TollgateError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tollgate_core_resilience::retry::DEFAULT_RETRYABLE_STATUS_CODES;
use tollgate_core_resilience::{
    AdaptiveConfig, BackoffPolicy, CircuitBreakerConfig, ExecutionConfig, RateLimiterConfig,
    RetryPolicy, TokenBucketConfig,
};

/// Main configuration for the client resilience layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Retries allowed after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay after the first failed attempt, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    /// Upper bound on the backoff delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    /// Backoff growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomise backoff delays by up to ±50%
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Status codes treated as transient
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: BTreeSet<u16>,

    /// Honour `Retry-After` from the server
    #[serde(default = "default_true")]
    pub respect_retry_after: bool,

    /// Token bucket capacity
    #[serde(default = "default_capacity")]
    pub rate_limit_capacity: f64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,

    /// Overdraft ceiling for bursts (must exceed capacity)
    #[serde(default)]
    pub burst_capacity: Option<f64>,

    /// Adjust the refill rate from success and 429 feedback
    #[serde(default)]
    pub adaptive: bool,

    #[serde(default = "default_adaptive_min_rate")]
    pub adaptive_min_rate: f64,

    #[serde(default = "default_adaptive_max_rate")]
    pub adaptive_max_rate: f64,

    #[serde(default = "default_adaptive_increase")]
    pub adaptive_increase_factor: f64,

    #[serde(default = "default_adaptive_decrease")]
    pub adaptive_decrease_factor: f64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Seconds the circuit stays open before a trial request
    #[serde(default = "default_breaker_cooldown")]
    pub circuit_breaker_cooldown_secs: f64,

    /// Default deadline for a whole run, in seconds (None = no deadline)
    #[serde(default)]
    pub request_timeout_secs: Option<f64>,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,

    /// Per-destination overrides, keyed by destination name
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationOverrides>,
}

/// Settings a single destination may override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationOverrides {
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub rate_limit_capacity: Option<f64>,

    #[serde(default)]
    pub refill_rate_per_second: Option<f64>,

    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,

    #[serde(default)]
    pub circuit_breaker_cooldown_secs: Option<f64>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: true,
            retryable_status_codes: default_retryable_status_codes(),
            respect_retry_after: true,
            rate_limit_capacity: default_capacity(),
            refill_rate_per_second: default_refill_rate(),
            burst_capacity: None,
            adaptive: false,
            adaptive_min_rate: default_adaptive_min_rate(),
            adaptive_max_rate: default_adaptive_max_rate(),
            adaptive_increase_factor: default_adaptive_increase(),
            adaptive_decrease_factor: default_adaptive_decrease(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_breaker_cooldown(),
            request_timeout_secs: None,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
            destinations: BTreeMap::new(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect()
}

fn default_capacity() -> f64 {
    10.0
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_adaptive_min_rate() -> f64 {
    1.0
}

fn default_adaptive_max_rate() -> f64 {
    100.0
}

fn default_adaptive_increase() -> f64 {
    1.1
}

fn default_adaptive_decrease() -> f64 {
    0.75
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> f64 {
    60.0
}

/// Convert a seconds value from the config file into a `Duration`
fn secs(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        TollgateError::Config(format!(
            "{} must be a non-negative number of seconds (got {})",
            field, value
        ))
    })
}

impl TollgateConfig {
    /// Load configuration from a TOML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TollgateConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the defaults and every destination override
    pub fn validate(&self) -> Result<()> {
        self.execution_config(None)?.validate()?;
        for name in self.destinations.keys() {
            self.execution_config(Some(name))?.validate()?;
        }
        self.request_timeout()?;
        Ok(())
    }

    /// Conservative settings for fragile or strictly metered APIs
    pub fn conservative_preset() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 2.0,
            max_delay_secs: 120.0,
            rate_limit_capacity: 5.0,
            refill_rate_per_second: 2.0,
            adaptive: true,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: 120.0,
            ..Default::default()
        }
    }

    /// Aggressive settings for high-throughput internal services
    pub fn aggressive_preset() -> Self {
        Self {
            max_retries: 2,
            base_delay_secs: 0.2,
            max_delay_secs: 10.0,
            rate_limit_capacity: 50.0,
            refill_rate_per_second: 50.0,
            burst_capacity: Some(75.0),
            circuit_breaker_threshold: 10,
            circuit_breaker_cooldown_secs: 15.0,
            ..Default::default()
        }
    }

    fn overrides(&self, destination: Option<&str>) -> Option<&DestinationOverrides> {
        destination.and_then(|name| self.destinations.get(name))
    }

    /// Retry classification and budget for `destination` (None = defaults)
    pub fn retry_policy(&self, destination: Option<&str>) -> RetryPolicy {
        let max_retries = self
            .overrides(destination)
            .and_then(|o| o.max_retries)
            .unwrap_or(self.max_retries);
        RetryPolicy {
            max_retries,
            retryable_status_codes: self.retryable_status_codes.clone(),
            respect_retry_after: self.respect_retry_after,
            ..Default::default()
        }
    }

    /// Backoff schedule shared by every destination
    pub fn backoff_policy(&self) -> Result<BackoffPolicy> {
        Ok(BackoffPolicy {
            base_delay: secs("base_delay_secs", self.base_delay_secs)?,
            max_delay: secs("max_delay_secs", self.max_delay_secs)?,
            multiplier: self.multiplier,
            jitter: self.jitter,
        })
    }

    /// Rate limiter settings for `destination` (None = defaults)
    pub fn rate_limiter_config(&self, destination: Option<&str>) -> RateLimiterConfig {
        let overrides = self.overrides(destination);
        let capacity = overrides
            .and_then(|o| o.rate_limit_capacity)
            .unwrap_or(self.rate_limit_capacity);
        let refill_rate = overrides
            .and_then(|o| o.refill_rate_per_second)
            .unwrap_or(self.refill_rate_per_second);
        let adaptive = self.adaptive.then(|| AdaptiveConfig {
            min_rate: self.adaptive_min_rate,
            max_rate: self.adaptive_max_rate,
            increase_factor: self.adaptive_increase_factor,
            decrease_factor: self.adaptive_decrease_factor,
        });

        RateLimiterConfig {
            bucket: TokenBucketConfig {
                capacity,
                refill_rate,
                burst_capacity: self.burst_capacity,
            },
            respect_retry_after: self.respect_retry_after,
            adaptive,
        }
    }

    /// Circuit breaker settings for `destination` (None = defaults)
    pub fn circuit_breaker_config(&self, destination: Option<&str>) -> Result<CircuitBreakerConfig> {
        let overrides = self.overrides(destination);
        let cooldown_secs = overrides
            .and_then(|o| o.circuit_breaker_cooldown_secs)
            .unwrap_or(self.circuit_breaker_cooldown_secs);
        Ok(CircuitBreakerConfig {
            failure_threshold: overrides
                .and_then(|o| o.circuit_breaker_threshold)
                .unwrap_or(self.circuit_breaker_threshold),
            cooldown: secs("circuit_breaker_cooldown_secs", cooldown_secs)?,
        })
    }

    /// Complete controller settings for `destination` (None = defaults)
    pub fn execution_config(&self, destination: Option<&str>) -> Result<ExecutionConfig> {
        Ok(ExecutionConfig {
            retry: self.retry_policy(destination),
            backoff: self.backoff_policy()?,
            rate_limit: self.rate_limiter_config(destination),
            circuit_breaker: self.circuit_breaker_config(destination)?,
        })
    }

    /// Default run deadline
    pub fn request_timeout(&self) -> Result<Option<Duration>> {
        self.request_timeout_secs
            .map(|value| secs("request_timeout_secs", value))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TollgateConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_secs, 1.0);
        assert_eq!(config.max_delay_secs, 60.0);
        assert_eq!(config.multiplier, 2.0);
        assert!(config.jitter);
        assert_eq!(
            config.retryable_status_codes,
            [429, 502, 503, 504].into_iter().collect()
        );
        assert!(!config.adaptive);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = TollgateConfig::from_toml_str("").unwrap();
        assert_eq!(config, TollgateConfig::default());
    }

    #[test]
    fn test_presets_are_valid() {
        let conservative = TollgateConfig::conservative_preset();
        assert!(conservative.adaptive);
        assert!(conservative.validate().is_ok());

        let aggressive = TollgateConfig::aggressive_preset();
        assert_eq!(aggressive.burst_capacity, Some(75.0));
        assert!(aggressive.validate().is_ok());
    }

    #[test]
    fn test_destination_overrides() {
        let config = TollgateConfig::from_toml_str(
            r#"
            max_retries = 4
            refill_rate_per_second = 5.0

            [destinations."api.github.com"]
            refill_rate_per_second = 1.0
            circuit_breaker_threshold = 2
            max_retries = 1
            "#,
        )
        .unwrap();

        let github = config.execution_config(Some("api.github.com")).unwrap();
        assert_eq!(github.rate_limit.bucket.refill_rate, 1.0);
        assert_eq!(github.circuit_breaker.failure_threshold, 2);
        assert_eq!(github.retry.max_retries, 1);

        let other = config.execution_config(Some("example.com")).unwrap();
        assert_eq!(other.rate_limit.bucket.refill_rate, 5.0);
        assert_eq!(other.circuit_breaker.failure_threshold, 5);
        assert_eq!(other.retry.max_retries, 4);
    }

    #[test]
    fn test_converters() {
        let config = TollgateConfig {
            adaptive: true,
            base_delay_secs: 0.5,
            circuit_breaker_cooldown_secs: 30.0,
            request_timeout_secs: Some(12.5),
            ..Default::default()
        };

        let backoff = config.backoff_policy().unwrap();
        assert_eq!(backoff.base_delay, Duration::from_millis(500));
        assert!(backoff.jitter);

        let limiter = config.rate_limiter_config(None);
        assert_eq!(limiter.adaptive, Some(AdaptiveConfig::default()));

        let breaker = config.circuit_breaker_config(None).unwrap();
        assert_eq!(breaker.cooldown, Duration::from_secs(30));

        assert_eq!(
            config.request_timeout().unwrap(),
            Some(Duration::from_millis(12_500))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = TollgateConfig::from_toml_str("rate_limit_capacity = 0.0").unwrap_err();
        assert!(err.is_config_error());

        let err = TollgateConfig::from_toml_str("base_delay_secs = -1.0").unwrap_err();
        assert!(err.is_config_error());

        let err = TollgateConfig::from_toml_str(
            r#"
            [destinations.bad]
            circuit_breaker_threshold = 0
            "#,
        )
        .unwrap_err();
        assert!(err.is_config_error());

        let err = TollgateConfig::from_toml_str("max_retries = \"lots\"").unwrap_err();
        assert!(matches!(err, TollgateError::ConfigParse(_)));
    }

    #[test]
    fn test_file_round_trip() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut config = TollgateConfig::conservative_preset();
        config.destinations.insert(
            "billing".to_string(),
            DestinationOverrides {
                refill_rate_per_second: Some(1.5),
                ..Default::default()
            },
        );

        config.to_file(temp_file.path()).unwrap();
        let loaded = TollgateConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_log_level_parsing() {
        let config = TollgateConfig::from_toml_str("log_level = \"debug\"").unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_level.to_tracing_level(), tracing::Level::DEBUG);
    }
}
