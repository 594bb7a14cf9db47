//! Control plane configuration.
//!
//! Recognized options, with their environment variables:
//!
//! | Field | Env | Default |
//! |-------|-----|---------|
//! | `chunk_size` | `JOBCTL_CHUNK_SIZE` | 200 (max 2000) |
//! | `timeout_seconds` | `JOBCTL_TIMEOUT_SECONDS` | none |
//! | `allow_external_calls` | `JOBCTL_ALLOW_EXTERNAL_CALLS` | false |
//! | `max_retries` | `JOBCTL_MAX_RETRIES` | 3 |
//! | `backoff_base_seconds` | `JOBCTL_BACKOFF_BASE_SECONDS` | 5 |
//! | `backoff_cap_seconds` | `JOBCTL_BACKOFF_CAP_SECONDS` | 300 |
//! | `chain_depth_limit` | `JOBCTL_CHAIN_DEPTH_LIMIT` | 5 |
//! | `error_tolerance_for_chaining` | `JOBCTL_ERROR_TOLERANCE_FOR_CHAINING` | 0 |
//! | `poll_interval_seconds` | `JOBCTL_POLL_INTERVAL_SECONDS` | 5 (1..=60) |
//! | `concurrency_ceiling` | `JOBCTL_CONCURRENCY_CEILING` | 5 |
//! | `engine_name` | `JOBCTL_ENGINE_NAME` | `jobctl-engine` |
//!
//! Every process sharing one store needs its own `engine_name`: records are
//! stamped with it, and only the named engine reconciles them.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobctl_core::{LaunchConfig, MAX_CHUNK_SIZE};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("malformed configuration document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub chunk_size: usize,
    pub timeout_seconds: Option<u64>,
    pub allow_external_calls: bool,
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
    pub chain_depth_limit: usize,
    pub error_tolerance_for_chaining: u64,
    pub poll_interval_seconds: u64,
    pub concurrency_ceiling: usize,
    pub engine_name: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            timeout_seconds: None,
            allow_external_calls: false,
            max_retries: 3,
            backoff_base_seconds: 5,
            backoff_cap_seconds: 300,
            chain_depth_limit: 5,
            error_tolerance_for_chaining: 0,
            poll_interval_seconds: 5,
            concurrency_ceiling: 5,
            engine_name: "jobctl-engine".to_string(),
        }
    }
}

impl ControlConfig {
    /// Load from `JOBCTL_*` environment variables; unset ones keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup (same keys as the environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        set(&lookup, "JOBCTL_CHUNK_SIZE", &mut config.chunk_size)?;
        if let Some(raw) = lookup("JOBCTL_TIMEOUT_SECONDS") {
            config.timeout_seconds = Some(parse("JOBCTL_TIMEOUT_SECONDS", &raw)?);
        }
        if let Some(raw) = lookup("JOBCTL_ALLOW_EXTERNAL_CALLS") {
            config.allow_external_calls = parse_bool("JOBCTL_ALLOW_EXTERNAL_CALLS", &raw)?;
        }
        set(&lookup, "JOBCTL_MAX_RETRIES", &mut config.max_retries)?;
        set(&lookup, "JOBCTL_BACKOFF_BASE_SECONDS", &mut config.backoff_base_seconds)?;
        set(&lookup, "JOBCTL_BACKOFF_CAP_SECONDS", &mut config.backoff_cap_seconds)?;
        set(&lookup, "JOBCTL_CHAIN_DEPTH_LIMIT", &mut config.chain_depth_limit)?;
        set(
            &lookup,
            "JOBCTL_ERROR_TOLERANCE_FOR_CHAINING",
            &mut config.error_tolerance_for_chaining,
        )?;
        set(&lookup, "JOBCTL_POLL_INTERVAL_SECONDS", &mut config.poll_interval_seconds)?;
        set(&lookup, "JOBCTL_CONCURRENCY_CEILING", &mut config.concurrency_ceiling)?;
        set(&lookup, "JOBCTL_ENGINE_NAME", &mut config.engine_name)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON document; missing fields keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.timeout_seconds == Some(0) {
            return Err(ConfigError::Invalid("timeout_seconds must be positive".to_string()));
        }
        if self.backoff_cap_seconds < self.backoff_base_seconds {
            return Err(ConfigError::Invalid(format!(
                "backoff_cap_seconds ({}) is below backoff_base_seconds ({})",
                self.backoff_cap_seconds, self.backoff_base_seconds
            )));
        }
        if self.chain_depth_limit == 0 {
            return Err(ConfigError::Invalid("chain_depth_limit must be at least 1".to_string()));
        }
        if !(1..=60).contains(&self.poll_interval_seconds) {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_seconds must be within 1..=60, got {}",
                self.poll_interval_seconds
            )));
        }
        if self.concurrency_ceiling == 0 {
            return Err(ConfigError::Invalid("concurrency_ceiling must be at least 1".to_string()));
        }
        if self.engine_name.trim().is_empty() {
            return Err(ConfigError::Invalid("engine_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Launch options applied when a dispatch does not set its own.
    pub fn launch_defaults(&self) -> LaunchConfig {
        LaunchConfig {
            chunk_size: Some(self.chunk_size),
            timeout_seconds: self.timeout_seconds,
            allow_external_calls: self.allow_external_calls,
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn set<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = parse(key, &raw)?;
    }
    Ok(())
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
    fn defaults_are_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 200);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.error_tolerance_for_chaining, 0);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = ControlConfig::from_lookup(lookup(&[
            ("JOBCTL_CHUNK_SIZE", "500"),
            ("JOBCTL_ALLOW_EXTERNAL_CALLS", "yes"),
            ("JOBCTL_TIMEOUT_SECONDS", "30"),
            ("JOBCTL_CHAIN_DEPTH_LIMIT", "8"),
            ("JOBCTL_ENGINE_NAME", "worker-a"),
        ]))
        .unwrap();
        assert_eq!(config.engine_name, "worker-a");
        assert_eq!(config.chunk_size, 500);
        assert!(config.allow_external_calls);
        assert_eq!(config.timeout_seconds, Some(30));
        assert_eq!(config.chain_depth_limit, 8);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn bad_values_are_reported_with_their_key() {
        let err = ControlConfig::from_lookup(lookup(&[("JOBCTL_MAX_RETRIES", "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "JOBCTL_MAX_RETRIES".to_string(),
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn validation_rejects_out_of_range_settings() {
        assert!(ControlConfig::from_lookup(lookup(&[("JOBCTL_CHUNK_SIZE", "2001")])).is_err());
        assert!(ControlConfig::from_lookup(lookup(&[("JOBCTL_POLL_INTERVAL_SECONDS", "0")])).is_err());
        assert!(ControlConfig::from_lookup(lookup(&[("JOBCTL_ENGINE_NAME", " ")])).is_err());
        assert!(
            ControlConfig::from_lookup(lookup(&[
                ("JOBCTL_BACKOFF_BASE_SECONDS", "60"),
                ("JOBCTL_BACKOFF_CAP_SECONDS", "10"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn json_documents_fill_missing_fields() {
        let config = ControlConfig::from_json_str(r#"{"max_retries": 1, "chunk_size": 50}"#).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.backoff_cap_seconds, 300);
        assert!(matches!(
            ControlConfig::from_json_str("{not json"),
            Err(ConfigError::Malformed(_))
        ));
    }
}
