//! Server configuration from environment variables.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chatty_observability::LogFormat;
use chatty_queue::QueueConfig;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_REDIS_HOST: &str = "redis://127.0.0.1:6379";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `PORT`
    pub port: u16,
    /// `REDIS_HOST`, a redis:// URL
    pub redis_host: String,
    /// `LOG_FORMAT` (`json` | `pretty`)
    pub log_format: LogFormat,
    /// `QUEUE_POLL_INTERVAL_MS`
    pub poll_interval: Duration,
    /// `QUEUE_LEASE_MS`
    pub lease_duration: Duration,
    /// `QUEUE_STALL_INTERVAL_MS`
    pub stall_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            port: DEFAULT_PORT,
            redis_host: DEFAULT_REDIS_HOST.to_string(),
            log_format: LogFormat::default(),
            poll_interval: queue.poll_interval,
            lease_duration: queue.lease_duration,
            stall_interval: queue.stall_interval,
        }
    }
}

fn parse_millis(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::invalid(key, value, e))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::invalid("PORT", port, e))?;
        }
        if let Some(host) = lookup("REDIS_HOST") {
            config.redis_host = host;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|e| ConfigError::invalid("LOG_FORMAT", format, e))?;
        }
        if let Some(ms) = lookup("QUEUE_POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis("QUEUE_POLL_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = lookup("QUEUE_LEASE_MS") {
            config.lease_duration = parse_millis("QUEUE_LEASE_MS", ms)?;
        }
        if let Some(ms) = lookup("QUEUE_STALL_INTERVAL_MS") {
            config.stall_interval = parse_millis("QUEUE_STALL_INTERVAL_MS", ms)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.redis_host.starts_with("redis://") || self.redis_host.starts_with("rediss://")) {
            return Err(ConfigError::invalid(
                "REDIS_HOST",
                &self.redis_host,
                "expected a redis:// or rediss:// URL",
            ));
        }

        let positive = [
            ("QUEUE_POLL_INTERVAL_MS", self.poll_interval),
            ("QUEUE_LEASE_MS", self.lease_duration),
            ("QUEUE_STALL_INTERVAL_MS", self.stall_interval),
        ];
        for (key, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "0", "must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_lease_duration(self.lease_duration)
            .with_stall_interval(self.stall_interval)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 5000);
        assert_eq!(config.redis_host, "redis://127.0.0.1:6379");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn variables_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("REDIS_HOST", "redis://cache:6379"),
            ("LOG_FORMAT", "pretty"),
            ("QUEUE_LEASE_MS", "10000"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr().port(), 8080);
        assert_eq!(config.redis_host, "redis://cache:6379");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.queue_config().lease_duration, Duration::from_secs(10));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("PORT", "http")])).is_err());
        assert!(Config::from_lookup(lookup(&[("QUEUE_POLL_INTERVAL_MS", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LOG_FORMAT", "xml")])).is_err());

        let config = Config::from_lookup(lookup(&[("REDIS_HOST", "localhost:6379")])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_lookup(lookup(&[("QUEUE_STALL_INTERVAL_MS", "0")])).unwrap();
        assert!(config.validate().is_err());
    }
}
