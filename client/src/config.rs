//! Configuration management for the client runtime.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loadable from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Delay before the first retry of a retryable failure
    pub retry_base_delay: Duration,
    /// Upper bound on any single backoff delay
    pub retry_max_delay: Duration,
    /// Sends per command before a retryable failure is treated as final
    pub max_attempts: u32,
    /// Time allowed for one backend send
    pub send_timeout: Duration,
    /// Durable command log location; no log when unset
    pub log_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            max_attempts: 10,
            send_timeout: Duration::from_secs(30),
            log_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retry_base_delay =
            millis_var(&lookup, "TETHER_RETRY_BASE_MS")?.unwrap_or(defaults.retry_base_delay);
        let retry_max_delay =
            millis_var(&lookup, "TETHER_RETRY_MAX_MS")?.unwrap_or(defaults.retry_max_delay);
        let send_timeout =
            millis_var(&lookup, "TETHER_SEND_TIMEOUT_MS")?.unwrap_or(defaults.send_timeout);

        let max_attempts = match lookup("TETHER_RETRY_MAX_ATTEMPTS") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                var: "TETHER_RETRY_MAX_ATTEMPTS",
                value: raw,
            })?,
            None => defaults.max_attempts,
        };

        let log_path = lookup("TETHER_LOG_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let config = Self {
            retry_base_delay,
            retry_max_delay,
            max_attempts,
            send_timeout,
            log_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::InvertedBackoff);
        }
        Ok(())
    }

    /// Delay before the send following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

fn millis_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        None => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("TETHER_RETRY_MAX_ATTEMPTS must be at least 1")]
    ZeroAttempts,

    #[error("retry base delay exceeds retry max delay")]
    InvertedBackoff,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = Config::from_lookup(lookup_from(&[
            ("TETHER_RETRY_BASE_MS", "250"),
            ("TETHER_RETRY_MAX_MS", "4000"),
            ("TETHER_RETRY_MAX_ATTEMPTS", "3"),
            ("TETHER_SEND_TIMEOUT_MS", "5000"),
            ("TETHER_LOG_PATH", "/tmp/tether.log"),
        ]))
        .unwrap();

        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.retry_max_delay, Duration::from_millis(4000));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/tether.log")));
    }

    #[test]
    fn rejects_bad_values() {
        let result = Config::from_lookup(lookup_from(&[("TETHER_RETRY_BASE_MS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidNumber {
                var: "TETHER_RETRY_BASE_MS",
                ..
            })
        ));

        let result = Config::from_lookup(lookup_from(&[("TETHER_RETRY_MAX_ATTEMPTS", "0")]));
        assert!(matches!(result, Err(ConfigError::ZeroAttempts)));

        let result = Config::from_lookup(lookup_from(&[
            ("TETHER_RETRY_BASE_MS", "5000"),
            ("TETHER_RETRY_MAX_MS", "10"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvertedBackoff)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = Config {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(1000),
            ..Config::default()
        };

        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_millis(1000));
        assert_eq!(config.backoff(64), Duration::from_millis(1000));
    }
}
