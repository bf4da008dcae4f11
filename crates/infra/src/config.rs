//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::buffer::BufferConfig;
use crate::retry::RetryPolicy;
use crate::services::DispatcherConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// Unset: in-memory stores.
    pub database_url: Option<String>,
    /// Unset: ingestion disabled.
    pub redis_url: Option<String>,
    pub buffer: BufferConfig,
    pub broker_reconnect_delay: Duration,
    pub dispatcher: DispatcherConfig,
    pub sweep_interval: Duration,
    pub discovery_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            redis_url: None,
            buffer: BufferConfig::default(),
            broker_reconnect_delay: Duration::from_secs(5),
            dispatcher: DispatcherConfig::default(),
            sweep_interval: Duration::from_secs(30),
            discovery_ttl: Duration::from_secs(300),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let batch_size: usize = parse(&var, "TELEMETRY_BATCH_SIZE", defaults.buffer.max_size)?;
        if batch_size == 0 {
            return Err(invalid("TELEMETRY_BATCH_SIZE", "0", "must be at least 1"));
        }
        let flush_ms: u64 = parse(&var, "TELEMETRY_FLUSH_INTERVAL_MS", 5_000)?;
        if flush_ms == 0 {
            return Err(invalid("TELEMETRY_FLUSH_INTERVAL_MS", "0", "must be positive"));
        }
        let sweep_secs: u64 = parse(&var, "COMMAND_SWEEP_INTERVAL_SECS", 30)?;
        if sweep_secs == 0 {
            return Err(invalid("COMMAND_SWEEP_INTERVAL_SECS", "0", "must be positive"));
        }

        let discovery_ttl_secs: u64 = parse(&var, "DISCOVERY_TTL_SECS", 300)?;
        if discovery_ttl_secs == 0 {
            return Err(invalid("DISCOVERY_TTL_SECS", "0", "must be positive"));
        }

        let reward_base_points: i64 = parse(
            &var,
            "REWARD_BASE_POINTS",
            defaults.dispatcher.reward_base_points,
        )?;
        if reward_base_points < 1 {
            return Err(invalid(
                "REWARD_BASE_POINTS",
                &reward_base_points.to_string(),
                "must be at least 1",
            ));
        }

        let dispatcher = DispatcherConfig {
            command_timeout: Duration::from_secs(parse(&var, "COMMAND_TIMEOUT_SECS", 300)?),
            max_redispatch: parse(&var, "COMMAND_MAX_REDISPATCH", defaults.dispatcher.max_redispatch)?,
            reward_base_points,
            ..defaults.dispatcher
        };

        Ok(Self {
            listen_addr: parse(&var, "LISTEN_ADDR", defaults.listen_addr)?,
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            buffer: BufferConfig {
                max_size: batch_size,
                flush_interval: Duration::from_millis(flush_ms),
            },
            broker_reconnect_delay: Duration::from_millis(parse(
                &var,
                "BROKER_RECONNECT_DELAY_MS",
                5_000,
            )?),
            dispatcher,
            sweep_interval: Duration::from_secs(sweep_secs),
            discovery_ttl: Duration::from_secs(discovery_ttl_secs),
        })
    }

    /// Fixed-delay, unbounded reconnect policy for the broker.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(u32::MAX, self.broker_reconnect_delay)
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &raw, e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = from(&[]).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.buffer.max_size, 100);
        assert_eq!(config.buffer.flush_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect_policy().delay_for_attempt(7), Duration::from_secs(5));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/wattloop"),
            ("REDIS_URL", ""),
            ("TELEMETRY_BATCH_SIZE", "250"),
            ("COMMAND_TIMEOUT_SECS", "60"),
            ("COMMAND_MAX_REDISPATCH", "5"),
            ("REWARD_BASE_POINTS", "25"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert!(config.database_url.is_some());
        assert!(config.redis_url.is_none());
        assert_eq!(config.buffer.max_size, 250);
        assert_eq!(config.dispatcher.command_timeout, Duration::from_secs(60));
        assert_eq!(config.dispatcher.max_redispatch, 5);
        assert_eq!(config.dispatcher.reward_base_points, 25);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = from(&[("TELEMETRY_FLUSH_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("TELEMETRY_FLUSH_INTERVAL_MS"));
        assert!(from(&[("TELEMETRY_BATCH_SIZE", "0")]).is_err());
        assert!(from(&[("LISTEN_ADDR", "nowhere")]).is_err());
    }

    #[test]
    fn reward_base_points_must_be_positive() {
        for raw in ["0", "-5"] {
            let err = from(&[("REWARD_BASE_POINTS", raw)]).unwrap_err();
            assert!(err.to_string().contains("REWARD_BASE_POINTS"), "{raw}: {err}");
        }
        assert_eq!(
            from(&[("REWARD_BASE_POINTS", "1")]).unwrap().dispatcher.reward_base_points,
            1
        );
    }

    #[test]
    fn discovery_ttl_must_be_positive() {
        assert!(from(&[("DISCOVERY_TTL_SECS", "0")]).is_err());
        assert_eq!(
            from(&[("DISCOVERY_TTL_SECS", "60")]).unwrap().discovery_ttl,
            Duration::from_secs(60)
        );
    }
}
