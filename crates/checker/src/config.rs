//! # Checker Configuration
//!
//! All settings come from the environment and are parsed once at startup.
//! Parsing goes through [`CheckerConfig::from_lookup`] so tests can feed a
//! plain map instead of mutating the process environment.
//!
//! ## Environment Variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `MAX_HEAD_BLOCK_LAG_TIME` (ms) | 2000 |
//! | `MAX_IRREVERSIBLE_BLOCK_LAG_NUMBER` | 500 |
//! | `TABLE_LIMIT` | 100 |
//! | `TEST_PLATFORM` | `p.twitter` |
//! | `ETCD` (JSON) | `{}` |
//! | `ETCD_SERVER_PREFIX` / `ECTD_SERVER_PREFIX` | `/traefik/backends/backend2/servers/` |
//! | `ZERO_WEIGHT` / `FULL_WEIGHT` | 0 / 100 |
//! | `REQUEST_TIMEOUT` (ms) | 10000 |
//! | `CHECK_INTERVAL` (ms) | 15000 |
//! | `MAX_IRREVERSIBLE_LAG_STEPS` | 3 |
//! | `MIN_SUCCESS_TABLE_STEP_COUNT` | 3 |
//! | `TICK_ERROR_DELAY` (ms) | 1000 |
//! | `RESTART_DELAY` (ms) | 1000 |
//! | `LOG_LEVEL` | `debug` |
//! | `LOG_PRETTY` | `false` |

use std::env;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default etcd endpoint when `ETCD` names no hosts.
pub const DEFAULT_ETCD_HOST: &str = "http://127.0.0.1:2379";

/// Default key prefix under which backend servers are registered.
pub const DEFAULT_SERVER_PREFIX: &str = "/traefik/backends/backend2/servers/";

// ════════════════════════════════════════════════════════════════════════════
// CONFIG ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Unrecoverable startup configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// Values parse individually but contradict each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

// ════════════════════════════════════════════════════════════════════════════
// ETCD PARAMS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Hosts {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct RawEtcdParams {
    #[serde(default)]
    hosts: Option<Hosts>,
}

/// Connection parameters for the etcd weight store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdParams {
    /// Base URLs, tried in order.
    pub hosts: Vec<String>,
}

impl Default for EtcdParams {
    fn default() -> Self {
        Self {
            hosts: vec![DEFAULT_ETCD_HOST.to_string()],
        }
    }
}

impl EtcdParams {
    /// Parses the `ETCD` JSON document (`{"hosts": "url"}` or
    /// `{"hosts": ["url", ...]}`). Unknown fields are ignored.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let parsed: RawEtcdParams =
            serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
                key: "ETCD",
                value: raw.to_string(),
                reason: e.to_string(),
            })?;

        let hosts: Vec<String> = match parsed.hosts {
            None => Vec::new(),
            Some(Hosts::One(host)) => vec![host],
            Some(Hosts::Many(hosts)) => hosts,
        }
        .into_iter()
        .map(|h| h.trim().trim_end_matches('/').to_string())
        .filter(|h| !h.is_empty())
        .collect();

        if hosts.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self { hosts })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CHECKER CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Full runtime configuration of the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerConfig {
    /// Maximum age of a node's head block.
    pub max_head_block_lag: Duration,
    /// Maximum distance between head and last irreversible block.
    pub max_irreversible_block_lag: u64,
    /// Page size of the consistency sample.
    pub table_limit: u64,
    /// Platform account whose user table is sampled.
    pub test_platform: String,
    /// Weight store connection.
    pub etcd: EtcdParams,
    /// Key prefix of the registered servers.
    pub server_prefix: String,
    /// Weight written for nodes that must receive no traffic.
    pub zero_weight: u64,
    /// Weight written for healthy nodes.
    pub full_weight: u64,
    /// Per network call timeout.
    pub request_timeout: Duration,
    /// Tick cadence.
    pub check_interval: Duration,
    /// Tolerated consecutive irreversible lag disagreements.
    pub max_irreversible_lag_steps: u32,
    /// Clean samples required before a table-size failure is forgiven.
    pub min_success_table_steps: u32,
    /// Pause after a failed tick.
    pub tick_error_delay: Duration,
    /// Backoff before the supervisor restarts the loop.
    pub restart_delay: Duration,
    /// Tracing filter directive.
    pub log_level: String,
    /// Human-readable log lines instead of JSON.
    pub log_pretty: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_head_block_lag: Duration::from_millis(2_000),
            max_irreversible_block_lag: 500,
            table_limit: 100,
            test_platform: "p.twitter".to_string(),
            etcd: EtcdParams::default(),
            server_prefix: DEFAULT_SERVER_PREFIX.to_string(),
            zero_weight: 0,
            full_weight: 100,
            request_timeout: Duration::from_millis(10_000),
            check_interval: Duration::from_millis(15_000),
            max_irreversible_lag_steps: 3,
            min_success_table_steps: 3,
            tick_error_delay: Duration::from_millis(1_000),
            restart_delay: Duration::from_millis(1_000),
            log_level: "debug".to_string(),
            log_pretty: false,
        }
    }
}

impl CheckerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary lookup function.
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(key) {
                Some(raw) => parse_number(key, &raw).map(Duration::from_millis),
                None => Ok(default),
            }
        };
        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(key) {
                Some(raw) => parse_number(key, &raw),
                None => Ok(default),
            }
        };
        let steps = |key: &'static str, default: u32| -> Result<u32, ConfigError> {
            let value = number(key, u64::from(default))?;
            u32::try_from(value).map_err(|_| ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "out of range".to_string(),
            })
        };

        let etcd = match get("ETCD") {
            Some(raw) => EtcdParams::from_json(&raw)?,
            None => defaults.etcd.clone(),
        };

        let server_prefix = get("ETCD_SERVER_PREFIX")
            .or_else(|| get("ECTD_SERVER_PREFIX"))
            .unwrap_or(defaults.server_prefix.clone());

        let config = Self {
            max_head_block_lag: millis("MAX_HEAD_BLOCK_LAG_TIME", defaults.max_head_block_lag)?,
            max_irreversible_block_lag: number(
                "MAX_IRREVERSIBLE_BLOCK_LAG_NUMBER",
                defaults.max_irreversible_block_lag,
            )?,
            table_limit: number("TABLE_LIMIT", defaults.table_limit)?,
            test_platform: get("TEST_PLATFORM").unwrap_or(defaults.test_platform.clone()),
            etcd,
            server_prefix,
            zero_weight: number("ZERO_WEIGHT", defaults.zero_weight)?,
            full_weight: number("FULL_WEIGHT", defaults.full_weight)?,
            request_timeout: millis("REQUEST_TIMEOUT", defaults.request_timeout)?,
            check_interval: millis("CHECK_INTERVAL", defaults.check_interval)?,
            max_irreversible_lag_steps: steps(
                "MAX_IRREVERSIBLE_LAG_STEPS",
                defaults.max_irreversible_lag_steps,
            )?,
            min_success_table_steps: steps(
                "MIN_SUCCESS_TABLE_STEP_COUNT",
                defaults.min_success_table_steps,
            )?,
            tick_error_delay: millis("TICK_ERROR_DELAY", defaults.tick_error_delay)?,
            restart_delay: millis("RESTART_DELAY", defaults.restart_delay)?,
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level.clone()),
            log_pretty: get("LOG_PRETTY").map(|v| parse_flag(&v)).unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_limit == 0 {
            return Err(ConfigError::Inconsistent(
                "TABLE_LIMIT must be greater than zero".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "CHECK_INTERVAL must be greater than zero".to_string(),
            ));
        }
        if self.zero_weight == self.full_weight {
            return Err(ConfigError::Inconsistent(format!(
                "ZERO_WEIGHT and FULL_WEIGHT are both {}",
                self.zero_weight
            )));
        }
        Ok(())
    }
}

/// Parses a non-negative integer, also accepting integral scientific
/// notation such as `2e3`.
fn parse_number(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<u64>() {
        return Ok(value);
    }

    let invalid = |reason: &str| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let float: f64 = trimmed.parse().map_err(|_| invalid("not a number"))?;
    if !float.is_finite() || float < 0.0 {
        return Err(invalid("must be a finite non-negative number"));
    }
    if float.fract() != 0.0 {
        return Err(invalid("must be an integer"));
    }
    if float > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(float as u64)
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = CheckerConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config, CheckerConfig::default());
        assert_eq!(config.etcd.hosts, vec![DEFAULT_ETCD_HOST.to_string()]);
        assert_eq!(config.check_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_overrides_and_scientific_notation() {
        let config = CheckerConfig::from_lookup(lookup(&[
            ("MAX_HEAD_BLOCK_LAG_TIME", "3e3"),
            ("TABLE_LIMIT", "50"),
            ("TEST_PLATFORM", "p.steemit"),
            ("FULL_WEIGHT", "10"),
            ("CHECK_INTERVAL", "1e4"),
            ("MAX_IRREVERSIBLE_LAG_STEPS", "5"),
            ("LOG_PRETTY", "true"),
        ]))
        .expect("valid overrides");

        assert_eq!(config.max_head_block_lag, Duration::from_millis(3_000));
        assert_eq!(config.table_limit, 50);
        assert_eq!(config.test_platform, "p.steemit");
        assert_eq!(config.full_weight, 10);
        assert_eq!(config.check_interval, Duration::from_millis(10_000));
        assert_eq!(config.max_irreversible_lag_steps, 5);
        assert!(config.log_pretty);
    }

    #[test]
    fn test_legacy_prefix_alias() {
        let config = CheckerConfig::from_lookup(lookup(&[("ECTD_SERVER_PREFIX", "/a/b/")]))
            .expect("valid");
        assert_eq!(config.server_prefix, "/a/b/");

        let config = CheckerConfig::from_lookup(lookup(&[
            ("ECTD_SERVER_PREFIX", "/legacy/"),
            ("ETCD_SERVER_PREFIX", "/current/"),
        ]))
        .expect("valid");
        assert_eq!(config.server_prefix, "/current/");
    }

    #[test]
    fn test_etcd_hosts_string_or_list() {
        let one = EtcdParams::from_json(r#"{"hosts":"http://etcd:2379/"}"#).expect("json");
        assert_eq!(one.hosts, vec!["http://etcd:2379".to_string()]);

        let many =
            EtcdParams::from_json(r#"{"hosts":["http://a:2379","http://b:2379"],"auth":{}}"#)
                .expect("json");
        assert_eq!(many.hosts.len(), 2);

        let empty = EtcdParams::from_json("{}").expect("json");
        assert_eq!(empty, EtcdParams::default());
    }

    #[test]
    fn test_rejects_garbage() {
        let err = CheckerConfig::from_lookup(lookup(&[("TABLE_LIMIT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TABLE_LIMIT", .. }));

        let err = CheckerConfig::from_lookup(lookup(&[("REQUEST_TIMEOUT", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "REQUEST_TIMEOUT", .. }));

        let err = CheckerConfig::from_lookup(lookup(&[("ETCD", "not json")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ETCD", .. }));
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let err = CheckerConfig::from_lookup(lookup(&[("FULL_WEIGHT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = CheckerConfig::from_lookup(lookup(&[("TABLE_LIMIT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = CheckerConfig::from_lookup(lookup(&[("CHECK_INTERVAL", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
