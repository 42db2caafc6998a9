//! Configuration for the beacon telemetry agent.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use beacon_core::{Destination, DropPolicy, ScrubRules};
use beacon_delivery::{BackoffStrategy, QueueConfig, RetryPolicy, TransportConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    client::ClientSettings,
    error::{ClientError, Result},
    logger::{LogLevel, LoggerOptions},
};

/// Configuration file read from the working directory.
pub const CONFIG_FILE: &str = "beacon.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "BEACON_";

/// Complete agent configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `BEACON_` (highest priority)
/// 2. Configuration file (`beacon.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Every field has a default except the credentials: `access_token` must be
/// set by the file or the environment before `validate` passes.
///
/// # Example
///
/// ```no_run
/// use beacon_client::Config;
///
/// // BEACON_ACCESS_TOKEN=... in the environment
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Reporting to {}", config.endpoint);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Destination
    /// Project access token.
    ///
    /// Environment variable: `BEACON_ACCESS_TOKEN`
    #[serde(default)]
    pub access_token: String,
    /// Collector URL items are posted to.
    ///
    /// Environment variable: `BEACON_ENDPOINT`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment name attached to every item.
    ///
    /// Environment variable: `BEACON_ENVIRONMENT`
    #[serde(default = "default_environment")]
    pub environment: String,

    // Scrubbing
    /// Field names and dotted paths masked before items are queued.
    ///
    /// Environment variable: `BEACON_SCRUB_FIELDS`
    #[serde(default = "default_scrub_fields")]
    pub scrub_fields: Vec<String>,
    /// Fields that are never masked even when listed in `scrub_fields`.
    ///
    /// Environment variable: `BEACON_CRITICAL_FIELDS`
    #[serde(default = "default_critical_fields")]
    pub critical_fields: Vec<String>,

    // Admission
    /// Items one scope may report before it is silenced. Zero disables the
    /// limit.
    ///
    /// Environment variable: `BEACON_MAX_ITEMS`
    #[serde(default = "default_max_items")]
    pub max_items: u32,
    /// Lowest level loggers report.
    ///
    /// Environment variable: `BEACON_MIN_LEVEL`
    #[serde(default)]
    pub min_level: LogLevel,

    // Telemetry
    /// Send a trail of recent events with every item.
    ///
    /// Environment variable: `BEACON_TELEMETRY_ENABLED`
    #[serde(default)]
    pub telemetry_enabled: bool,
    /// Events kept in the trail.
    ///
    /// Environment variable: `BEACON_TELEMETRY_QUEUE_DEPTH`
    #[serde(default = "default_telemetry_queue_depth")]
    pub telemetry_queue_depth: usize,

    // Delivery
    /// Items each destination may send per minute.
    ///
    /// Environment variable: `BEACON_MAX_REPORTS_PER_MINUTE`
    #[serde(default = "default_max_reports_per_minute")]
    pub max_reports_per_minute: u32,
    /// Sleep of an idle delivery worker in milliseconds.
    ///
    /// Environment variable: `BEACON_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `BEACON_REQUEST_TIMEOUT_SECS`
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Outcome events buffered per subscriber.
    ///
    /// Environment variable: `BEACON_EVENT_CHANNEL_CAPACITY`
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// SQLite file backing the queue. Absent keeps the queue in memory.
    ///
    /// Environment variable: `BEACON_STORE_PATH`
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    // Retry
    /// Maximum delivery attempts per item, including the first.
    ///
    /// Environment variable: `BEACON_MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff in milliseconds.
    ///
    /// Environment variable: `BEACON_RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    ///
    /// Environment variable: `BEACON_RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `BEACON_RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor")]
    pub retry_jitter_factor: f64,
    /// Backoff curve: `fixed`, `linear` or `exponential`.
    ///
    /// Environment variable: `BEACON_BACKOFF_STRATEGY`
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Fate of items that exhaust their attempts: `drop` or `dead_letter`.
    ///
    /// Environment variable: `BEACON_DROP_POLICY`
    #[serde(default)]
    pub drop_policy: DropPolicy,

    // Shutdown
    /// Abort workers on stop instead of letting them finish.
    ///
    /// Environment variable: `BEACON_STOP_IMMEDIATELY`
    #[serde(default)]
    pub stop_immediately: bool,
    /// Bound on joining workers during an immediate stop, in seconds.
    ///
    /// Environment variable: `BEACON_STOP_TIMEOUT_SECS`
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// How long a blocking log waits for an outcome, in milliseconds.
    ///
    /// Environment variable: `BEACON_BLOCKING_TIMEOUT_MS`
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: u64,
}

impl Config {
    /// Load configuration from defaults, `beacon.toml`, and `BEACON_*`
    /// environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if a source cannot be parsed or
    /// the merged configuration is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`Config::load`] with an explicit configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if a source cannot be parsed or
    /// the merged configuration is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider chain `load_from` extracts from.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.access_token.trim().is_empty() {
            return Err(ClientError::configuration("access_token must be set"));
        }

        if self.endpoint.trim().is_empty() {
            return Err(ClientError::configuration("endpoint must be set"));
        }

        if self.max_reports_per_minute == 0 {
            return Err(ClientError::configuration("max_reports_per_minute must be greater than 0"));
        }

        if self.max_attempts == 0 {
            return Err(ClientError::configuration("max_attempts must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(ClientError::configuration(
                "retry_jitter_factor must be between 0.0 and 1.0",
            ));
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ClientError::configuration(
                "retry_base_delay_ms cannot exceed retry_max_delay_ms",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ClientError::configuration("poll_interval_ms must be greater than 0"));
        }

        if self.event_channel_capacity == 0 {
            return Err(ClientError::configuration("event_channel_capacity must be greater than 0"));
        }

        if self.blocking_timeout_ms == 0 {
            return Err(ClientError::configuration("blocking_timeout_ms must be greater than 0"));
        }

        if self.telemetry_enabled && self.telemetry_queue_depth == 0 {
            return Err(ClientError::configuration(
                "telemetry_queue_depth must be greater than 0 when telemetry is enabled",
            ));
        }

        Ok(())
    }

    /// Destination every client built from this configuration reports to.
    pub fn destination(&self) -> Destination {
        Destination::new(self.endpoint.trim(), self.access_token.trim())
    }

    /// Scrub rules with the critical fields filtered out.
    pub fn scrub_rules(&self) -> ScrubRules {
        let critical = self.critical_fields.as_slice();
        ScrubRules::from_fields(self.scrub_fields.as_slice(), Some(critical))
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: self.backoff_strategy,
        }
    }

    /// Convert to the queue controller configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_reports_per_minute: self.max_reports_per_minute,
            retry_policy: self.to_retry_policy(),
            drop_policy: self.drop_policy,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }

    /// Convert to transport configuration.
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(self.request_timeout_secs),
            ..TransportConfig::default()
        }
    }

    /// Settings of the default client.
    pub fn to_client_settings(&self) -> ClientSettings {
        ClientSettings {
            destination: self.destination(),
            environment: self.environment.clone(),
            scrub_rules: self.scrub_rules(),
            blocking_timeout: self.blocking_timeout(),
            telemetry_enabled: self.telemetry_enabled,
            telemetry_queue_depth: self.telemetry_queue_depth,
        }
    }

    /// Options shared by every logger.
    pub fn to_logger_options(&self) -> LoggerOptions {
        LoggerOptions { min_level: self.min_level, max_items: self.max_items }
    }

    /// Default wait of a blocking log.
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            endpoint: default_endpoint(),
            environment: default_environment(),
            scrub_fields: default_scrub_fields(),
            critical_fields: default_critical_fields(),
            max_items: default_max_items(),
            min_level: LogLevel::default(),
            telemetry_enabled: false,
            telemetry_queue_depth: default_telemetry_queue_depth(),
            max_reports_per_minute: default_max_reports_per_minute(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            store_path: None,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            backoff_strategy: BackoffStrategy::default(),
            drop_policy: DropPolicy::default(),
            stop_immediately: false,
            stop_timeout_secs: default_stop_timeout_secs(),
            blocking_timeout_ms: default_blocking_timeout_ms(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:8080/api/1/item/".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_scrub_fields() -> Vec<String> {
    ["passwd", "password", "secret", "confirm_password", "password_confirmation"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_critical_fields() -> Vec<String> {
    vec!["access_token".to_string()]
}

fn default_max_items() -> u32 {
    10
}

fn default_telemetry_queue_depth() -> usize {
    crate::telemetry::DEFAULT_TELEMETRY_QUEUE_DEPTH
}

fn default_max_reports_per_minute() -> u32 {
    60
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    beacon_core::events::DEFAULT_EVENT_CAPACITY
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_stop_timeout_secs() -> u64 {
    60
}

fn default_blocking_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config { access_token: "project-token".to_string(), ..Config::default() }
    }

    #[test]
    fn defaults_need_only_a_token() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn invalid_config_validation_fails() {
        let mut config = valid();
        config.endpoint = "  ".to_string();
        assert!(config.validate().is_err());

        config = valid();
        config.max_reports_per_minute = 0;
        assert!(config.validate().is_err());

        config = valid();
        config.max_attempts = 0;
        assert!(config.validate().is_err());

        config = valid();
        config.retry_jitter_factor = 1.5;
        assert!(config.validate().is_err());

        config = valid();
        config.retry_base_delay_ms = 120_000;
        assert!(config.validate().is_err());

        config = valid();
        config.event_channel_capacity = 0;
        assert!(config.validate().is_err());

        config = valid();
        config.telemetry_enabled = true;
        config.telemetry_queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn telemetry_settings_reach_the_client() {
        let defaults = valid().to_client_settings();
        assert!(!defaults.telemetry_enabled);
        assert_eq!(defaults.telemetry_queue_depth, 5);

        let config = Config { telemetry_enabled: true, telemetry_queue_depth: 12, ..valid() };
        let settings = config.to_client_settings();
        assert!(settings.telemetry_enabled);
        assert_eq!(settings.telemetry_queue_depth, 12);
    }

    #[test]
    fn critical_fields_are_never_scrubbed() {
        let config = Config {
            scrub_fields: vec![
                "password".to_string(),
                "access_token".to_string(),
                "data.request.headers.cookie".to_string(),
            ],
            ..valid()
        };

        let rules = config.scrub_rules();
        assert_eq!(rules.names(), ["password".to_string()]);
        assert_eq!(rules.paths(), ["data.request.headers.cookie".to_string()]);
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn conversions_carry_retry_settings() {
        let config = Config {
            max_attempts: 9,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4000,
            backoff_strategy: BackoffStrategy::Linear,
            drop_policy: DropPolicy::DeadLetter,
            poll_interval_ms: 10,
            stop_timeout_secs: 5,
            ..valid()
        };

        let queue = config.to_queue_config();
        assert_eq!(queue.retry_policy.max_attempts, 9);
        assert_eq!(queue.retry_policy.base_delay, Duration::from_millis(250));
        assert_eq!(queue.retry_policy.max_delay, Duration::from_secs(4));
        assert_eq!(queue.retry_policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(queue.drop_policy, DropPolicy::DeadLetter);
        assert_eq!(queue.poll_interval, Duration::from_millis(10));
        assert_eq!(queue.stop_timeout, Duration::from_secs(5));
        assert!(queue.validate().is_ok());

        let destination = config.destination();
        assert_eq!(destination.access_token.expose(), "project-token");
    }
}
