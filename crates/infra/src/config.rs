//! Environment-driven configuration.
//!
//! Every value is read once at startup; missing required values and values that
//! do not parse fail fast with a [`ConfigError`] naming the variable.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use circstore_events::Environment;

pub const KAFKA_HOST: &str = "KAFKA_HOST";
pub const KAFKA_PORT: &str = "KAFKA_PORT";
pub const ENV: &str = "ENV";
pub const REPLICATION_FACTOR: &str = "REPLICATION_FACTOR";
pub const MAX_REQUEST_SIZE: &str = "MAX_REQUEST_SIZE";
pub const OKAPI_URL: &str = "OKAPI_URL";
pub const MODULE_NAME: &str = "MODULE_NAME";
pub const MODULE_INSTANCE_ID: &str = "MODULE_INSTANCE_ID";
pub const CONSUMER_LOAD_LIMIT: &str = "CONSUMER_LOAD_LIMIT";
pub const GLOBAL_LOAD_LIMIT: &str = "GLOBAL_LOAD_LIMIT";
pub const PROVISION_RETRY_DELAY_MS: &str = "PROVISION_RETRY_DELAY_MS";

pub const DEFAULT_MODULE_NAME: &str = "mod-circulation-storage";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Broker endpoint and topic-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub replication_factor: u16,
    pub max_request_size: usize,
}

impl BrokerConfig {
    /// `host:port`, the key admin and consumer connections are opened against.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub broker: BrokerConfig,
    pub environment: Environment,
    /// Fallback forwarding URL for published records.
    pub okapi_url: Option<String>,
    pub module_name: String,
    pub instance_id: String,
    pub consumer_load_limit: usize,
    pub global_load_limit: usize,
    pub provision_retry_delay: Duration,
}

impl ServiceConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary lookup (tests, embedding).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get(KAFKA_HOST).ok_or(ConfigError::Missing(KAFKA_HOST))?;
        let port = parse_required(&get, KAFKA_PORT)?;

        let environment = match get(ENV) {
            Some(value) => Environment::parse(value.clone()).map_err(|e| ConfigError::Invalid {
                name: ENV,
                value,
                reason: e.to_string(),
            })?,
            None => Environment::default(),
        };

        let consumer_load_limit = parse_or(&get, CONSUMER_LOAD_LIMIT, 5usize)?;
        let global_load_limit = parse_or(&get, GLOBAL_LOAD_LIMIT, 50usize)?;
        for (name, limit) in [
            (CONSUMER_LOAD_LIMIT, consumer_load_limit),
            (GLOBAL_LOAD_LIMIT, global_load_limit),
        ] {
            if limit == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(Self {
            broker: BrokerConfig {
                host,
                port,
                replication_factor: parse_or(&get, REPLICATION_FACTOR, 1u16)?,
                max_request_size: parse_or(&get, MAX_REQUEST_SIZE, 4_000_000usize)?,
            },
            environment,
            okapi_url: get(OKAPI_URL),
            module_name: get(MODULE_NAME).unwrap_or_else(|| DEFAULT_MODULE_NAME.to_string()),
            instance_id: get(MODULE_INSTANCE_ID).unwrap_or_else(|| Uuid::now_v7().to_string()),
            consumer_load_limit,
            global_load_limit,
            provision_retry_delay: Duration::from_millis(parse_or(
                &get,
                PROVISION_RETRY_DELAY_MS,
                500u64,
            )?),
        })
    }
}

fn parse_required<T, G>(get: &G, name: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = get(name).ok_or(ConfigError::Missing(name))?;
    parse_value(name, value)
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => parse_value(name, value),
        None => Ok(default),
    }
}

fn parse_value<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_broker_is_given() {
        let cfg = config(&[(KAFKA_HOST, "kafka"), (KAFKA_PORT, "9092")]).unwrap();

        assert_eq!(cfg.broker.address(), "kafka:9092");
        assert_eq!(cfg.broker.replication_factor, 1);
        assert_eq!(cfg.broker.max_request_size, 4_000_000);
        assert_eq!(cfg.environment.as_str(), "folio");
        assert_eq!(cfg.module_name, DEFAULT_MODULE_NAME);
        assert_eq!(cfg.consumer_load_limit, 5);
        assert_eq!(cfg.global_load_limit, 50);
        assert_eq!(cfg.provision_retry_delay, Duration::from_millis(500));
        assert!(cfg.okapi_url.is_none());
        assert!(Uuid::parse_str(&cfg.instance_id).is_ok());
    }

    #[test]
    fn broker_host_and_port_are_required() {
        assert_eq!(config(&[(KAFKA_PORT, "9092")]), Err(ConfigError::Missing(KAFKA_HOST)));
        assert_eq!(config(&[(KAFKA_HOST, "kafka")]), Err(ConfigError::Missing(KAFKA_PORT)));
        assert_eq!(
            config(&[(KAFKA_HOST, "  "), (KAFKA_PORT, "9092")]),
            Err(ConfigError::Missing(KAFKA_HOST))
        );
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = config(&[(KAFKA_HOST, "kafka"), (KAFKA_PORT, "ninety")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: KAFKA_PORT, .. }));

        let err = config(&[(KAFKA_HOST, "kafka"), (KAFKA_PORT, "9092"), (ENV, "qa.east")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: ENV, .. }));
    }

    #[test]
    fn zero_load_limits_are_rejected() {
        let err = config(&[
            (KAFKA_HOST, "kafka"),
            (KAFKA_PORT, "9092"),
            (CONSUMER_LOAD_LIMIT, "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: CONSUMER_LOAD_LIMIT, .. }));
    }

    #[test]
    fn overrides_are_honoured() {
        let cfg = config(&[
            (KAFKA_HOST, "kafka"),
            (KAFKA_PORT, "29092"),
            (ENV, "qa"),
            (REPLICATION_FACTOR, "3"),
            (OKAPI_URL, "http://okapi:9130"),
            (MODULE_NAME, "mod-circ"),
            (MODULE_INSTANCE_ID, "node-1"),
            (CONSUMER_LOAD_LIMIT, "2"),
            (PROVISION_RETRY_DELAY_MS, "0"),
        ])
        .unwrap();

        assert_eq!(cfg.environment.as_str(), "qa");
        assert_eq!(cfg.broker.replication_factor, 3);
        assert_eq!(cfg.okapi_url.as_deref(), Some("http://okapi:9130"));
        assert_eq!(cfg.module_name, "mod-circ");
        assert_eq!(cfg.instance_id, "node-1");
        assert_eq!(cfg.consumer_load_limit, 2);
        assert_eq!(cfg.provision_retry_delay, Duration::ZERO);
    }
}
