//! Broker configuration.
//!
//! Every struct has a `Default` and deserializes from JSON with missing
//! fields filled from that default. Durations are given in milliseconds.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level broker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address this broker is reachable under (e.g. `"fabric:/shop/Broker"`).
    pub broker_address: String,

    /// Application scope the location record is written under.
    pub application_scope: String,

    /// Register `broker_address` for `application_scope` on startup.
    pub enable_auto_discovery: bool,

    /// Delivery loop settings.
    pub delivery: DeliveryConfig,

    /// Durable store settings.
    pub store: StoreConfig,

    /// Retry policy for registry and publish transactions.
    pub retry: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_address: "fabric:/switchboard/Broker".to_string(),
            application_scope: "fabric:/switchboard".to_string(),
            enable_auto_discovery: true,
            delivery: DeliveryConfig::default(),
            store: StoreConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Parse from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_address.is_empty() {
            return Err(BrokerError::Config("broker_address is empty".into()));
        }
        self.delivery.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(BrokerError::Config("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// Delivery loop timing and batching.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Quiescence delay before the first iteration.
    /// Default: 5s
    #[serde(with = "duration_ms")]
    pub due_time: Duration,

    /// Sleep between iterations.
    /// Default: 5s
    #[serde(with = "duration_ms")]
    pub period: Duration,

    /// Processing-time budget of one iteration.
    /// Default: 3s
    #[serde(with = "duration_ms")]
    pub max_processing_period: Duration,

    /// Max messages taken from one queue per iteration.
    /// Default: 100
    pub max_dequeues_per_iteration: u64,

    /// Consecutive rejections before a queue head is dead-lettered.
    /// None retries forever. Default: 10
    pub max_delivery_attempts: Option<u32>,

    /// Worker threads draining queues concurrently.
    /// Default: 4
    pub workers: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            due_time: Duration::from_secs(5),
            period: Duration::from_secs(5),
            max_processing_period: Duration::from_secs(3),
            max_dequeues_per_iteration: 100,
            max_delivery_attempts: Some(10),
            workers: 4,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(BrokerError::Config("delivery.workers must be > 0".into()));
        }
        if self.max_dequeues_per_iteration == 0 {
            return Err(BrokerError::Config(
                "delivery.max_dequeues_per_iteration must be > 0".into(),
            ));
        }
        if self.max_delivery_attempts == Some(0) {
            return Err(BrokerError::Config(
                "delivery.max_delivery_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Durable store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for the commit log and snapshot. None keeps state in memory.
    pub path: Option<PathBuf>,

    /// How long a transaction waits for a collection lock.
    /// Default: 4s
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,

    /// fsync the commit log on every commit.
    /// Default: true
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout: Duration::from_secs(4),
            sync_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// In-memory store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed store under `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Retry policy for transient transaction failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    /// Default: 3
    pub max_attempts: u32,

    /// Added to the wait after every failed attempt.
    /// Default: 50ms
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BrokerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.delivery.max_dequeues_per_iteration, 100);
        assert_eq!(config.delivery.max_processing_period, Duration::from_secs(3));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BrokerConfig::from_json_str(
            r#"{
                "broker_address": "fabric:/shop/Broker",
                "delivery": { "period": 250, "max_delivery_attempts": null }
            }"#,
        )
        .unwrap();

        assert_eq!(config.broker_address, "fabric:/shop/Broker");
        assert_eq!(config.delivery.period, Duration::from_millis(250));
        assert_eq!(config.delivery.due_time, Duration::from_secs(5));
        assert_eq!(config.delivery.max_delivery_attempts, None);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn test_invalid_workers_rejected() {
        let result = BrokerConfig::from_json_str(r#"{ "delivery": { "workers": 0 } }"#);
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broker.json");
        std::fs::write(&path, r#"{ "store": { "path": "/var/lib/broker", "lock_timeout": 100 } }"#)
            .unwrap();

        let config = BrokerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.store.path, Some(PathBuf::from("/var/lib/broker")));
        assert_eq!(config.store.lock_timeout, Duration::from_millis(100));
    }
}
