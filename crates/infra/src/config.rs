//! Configuration loading and representation.
//!
//! Every knob has a default, so an empty environment yields a working single-member
//! configuration. Values are read from `CLUSTER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use clustercmd_core::MemberId;

/// Response timeout used when neither the caller nor the configuration supplies one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tailing broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Maximum records kept by the capped store.
    pub max_records: usize,
    /// How long one tail poll waits for new records.
    pub poll_wait_ms: u64,
    /// Pause before reconnecting after a tail failure.
    pub reconnect_delay_ms: u64,
    /// ErrorsOverTime span for the reconnect loop.
    pub error_span: usize,
    /// ErrorsOverTime threshold for the reconnect loop.
    pub error_threshold_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            poll_wait_ms: 500,
            reconnect_delay_ms: 250,
            error_span: 5,
            error_threshold_ms: 3000,
        }
    }
}

impl BrokerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn error_threshold(&self) -> Duration {
        Duration::from_millis(self.error_threshold_ms)
    }
}

/// Process-level cluster command configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Registration key of this process. Generated when unset.
    pub member_id: Option<String>,
    /// Default response timeout for request/response commands.
    pub command_timeout_ms: Option<u64>,
    pub broker: BrokerConfig,
}

impl ClusterConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConfig::default();

        Ok(Self {
            member_id: lookup("CLUSTER_MEMBER_ID").filter(|v| !v.trim().is_empty()),
            command_timeout_ms: parse_opt(&lookup, "CLUSTER_COMMAND_TIMEOUT_MS")?,
            broker: BrokerConfig {
                max_records: parse_opt(&lookup, "CLUSTER_BROKER_MAX_RECORDS")?
                    .unwrap_or(defaults.max_records),
                poll_wait_ms: parse_opt(&lookup, "CLUSTER_BROKER_POLL_WAIT_MS")?
                    .unwrap_or(defaults.poll_wait_ms),
                reconnect_delay_ms: parse_opt(&lookup, "CLUSTER_BROKER_RECONNECT_DELAY_MS")?
                    .unwrap_or(defaults.reconnect_delay_ms),
                error_span: parse_opt(&lookup, "CLUSTER_BROKER_ERROR_SPAN")?
                    .unwrap_or(defaults.error_span),
                error_threshold_ms: parse_opt(&lookup, "CLUSTER_BROKER_ERROR_THRESHOLD_MS")?
                    .unwrap_or(defaults.error_threshold_ms),
            },
        })
    }

    /// This process's member id; a fresh one when not configured.
    pub fn member_id(&self) -> Result<MemberId, ConfigError> {
        match &self.member_id {
            Some(key) => MemberId::new(key.clone()).map_err(|e| ConfigError::Invalid {
                key: "CLUSTER_MEMBER_ID",
                value: key.clone(),
                reason: e.to_string(),
            }),
            None => Ok(MemberId::generate()),
        }
    }

    /// Configured default response timeout, if any.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_opt<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = ClusterConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(cfg.broker, BrokerConfig::default());
        assert_eq!(cfg.command_timeout(), None);
        assert!(cfg.member_id().is_ok());
    }

    #[test]
    fn reads_overrides() {
        let cfg = ClusterConfig::from_lookup(lookup(&[
            ("CLUSTER_MEMBER_ID", "node-a"),
            ("CLUSTER_COMMAND_TIMEOUT_MS", "750"),
            ("CLUSTER_BROKER_MAX_RECORDS", "42"),
            ("CLUSTER_BROKER_ERROR_SPAN", "3"),
        ]))
        .unwrap();

        assert_eq!(cfg.member_id().unwrap().as_str(), "node-a");
        assert_eq!(cfg.command_timeout(), Some(Duration::from_millis(750)));
        assert_eq!(cfg.broker.max_records, 42);
        assert_eq!(cfg.broker.error_span, 3);
        assert_eq!(cfg.broker.poll_wait(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let err = ClusterConfig::from_lookup(lookup(&[("CLUSTER_BROKER_POLL_WAIT_MS", "soon")]))
            .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { key: "CLUSTER_BROKER_POLL_WAIT_MS", .. }));
    }
}
