//! Deployment-tunable parameters
//!
//! Retry budgets, backoff curves, retention windows and timeouts are
//! configuration, never hard-coded contracts. Every struct deserializes with
//! serde (missing keys fall back to the defaults below) and
//! [`CoreConfig::from_env`] overlays `CLINIC_EVENTS_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RetryPolicy;

/// Event log client settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Backoff for appends failing with `LogUnavailable`
    pub publish_retry: RetryPolicy,
    /// Records fetched per read
    pub read_batch: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            publish_retry: RetryPolicy::default()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_millis(100)),
            read_batch: 64,
        }
    }
}

/// Outbox relay settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub poll_interval_millis: u64,
    /// Pending entries relayed per round
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: 200,
            batch_size: 100,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_millis = interval.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Idempotency guard settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long processed records are kept.
    ///
    /// Must exceed the maximum plausible consumer lag plus a safety margin,
    /// otherwise a very late redelivery is processed again.
    pub retention_millis: u64,
    /// Age after which an in-flight claim is considered abandoned.
    ///
    /// Must exceed the handler timeout.
    pub claim_ttl_millis: u64,
    pub prune_interval_millis: u64,
    /// Retry of idempotency store operations
    pub storage_retry: RetryPolicy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_millis: 7 * 24 * 60 * 60 * 1000,
            claim_ttl_millis: 5 * 60 * 1000,
            prune_interval_millis: 60 * 60 * 1000,
            storage_retry: RetryPolicy::default().with_initial_delay(Duration::from_millis(50)),
        }
    }
}

impl IdempotencyConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_millis = retention.as_millis() as u64;
        self
    }

    pub fn with_claim_ttl_millis(mut self, millis: u64) -> Self {
        self.claim_ttl_millis = millis;
        self
    }

    pub fn with_storage_retry(mut self, retry: RetryPolicy) -> Self {
        self.storage_retry = retry;
        self
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_millis.max(1))
    }
}

/// Consumer dispatcher settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on one handler execution
    pub handler_timeout_millis: u64,
    /// Redelivery budget and backoff for failing handlers
    pub retry: RetryPolicy,
    /// Retry of offset and dead-letter store writes
    pub storage_retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout_millis: 30_000,
            retry: RetryPolicy::default()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_millis(200)),
            storage_retry: RetryPolicy::default().with_initial_delay(Duration::from_millis(50)),
        }
    }
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_millis)
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_millis = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_storage_retry(mut self, retry: RetryPolicy) -> Self {
        self.storage_retry = retry;
        self
    }
}

/// Saga settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Budget for compensations failing with `SafeToRetry`
    pub compensation_retry: RetryPolicy,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            compensation_retry: RetryPolicy::default().with_max_attempts(5),
        }
    }
}

/// Root configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub log: LogConfig,
    pub relay: RelayConfig,
    pub idempotency: IdempotencyConfig,
    pub dispatcher: DispatcherConfig,
    pub saga: SagaConfig,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

impl CoreConfig {
    /// Defaults overlaid with `CLINIC_EVENTS_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up by variable name
    pub fn overlay(self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key: key.to_string(), value })
        }

        let mut config = self;
        macro_rules! set {
            ($key:literal => $($field:ident).+) => {
                if let Some(value) = lookup($key) {
                    config.$($field).+ = parse($key, value)?;
                }
            };
        }

        set!("CLINIC_EVENTS_PUBLISH_MAX_ATTEMPTS" => log.publish_retry.max_attempts);
        set!("CLINIC_EVENTS_READ_BATCH" => log.read_batch);
        set!("CLINIC_EVENTS_RELAY_POLL_MS" => relay.poll_interval_millis);
        set!("CLINIC_EVENTS_RELAY_BATCH" => relay.batch_size);
        set!("CLINIC_EVENTS_IDEMPOTENCY_RETENTION_MS" => idempotency.retention_millis);
        set!("CLINIC_EVENTS_IDEMPOTENCY_CLAIM_TTL_MS" => idempotency.claim_ttl_millis);
        set!("CLINIC_EVENTS_IDEMPOTENCY_PRUNE_MS" => idempotency.prune_interval_millis);
        set!("CLINIC_EVENTS_HANDLER_TIMEOUT_MS" => dispatcher.handler_timeout_millis);
        set!("CLINIC_EVENTS_HANDLER_MAX_ATTEMPTS" => dispatcher.retry.max_attempts);
        set!("CLINIC_EVENTS_HANDLER_BACKOFF_MS" => dispatcher.retry.initial_delay_millis);
        set!("CLINIC_EVENTS_COMPENSATION_MAX_ATTEMPTS" => saga.compensation_retry.max_attempts);

        if config.idempotency.claim_ttl_millis <= config.dispatcher.handler_timeout_millis {
            tracing::warn!(
                claim_ttl_ms = config.idempotency.claim_ttl_millis,
                handler_timeout_ms = config.dispatcher.handler_timeout_millis,
                "Claim TTL does not exceed the handler timeout; slow handlers may run twice"
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overlay_applies_overrides() {
        let env: HashMap<&str, &str> = [
            ("CLINIC_EVENTS_HANDLER_MAX_ATTEMPTS", "7"),
            ("CLINIC_EVENTS_IDEMPOTENCY_RETENTION_MS", "1000"),
        ]
        .into_iter()
        .collect();

        let config = CoreConfig::default()
            .overlay(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.dispatcher.retry.max_attempts, 7);
        assert_eq!(config.idempotency.retention_millis, 1000);
        assert_eq!(config.relay, RelayConfig::default());
    }

    #[test]
    fn overlay_rejects_malformed_values() {
        let err = CoreConfig::default()
            .overlay(|k| (k == "CLINIC_EVENTS_RELAY_BATCH").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "CLINIC_EVENTS_RELAY_BATCH".into(),
                value: "many".into()
            }
        );
    }

    #[test]
    fn defaults_keep_claims_longer_than_handlers() {
        let config = CoreConfig::default();
        assert!(config.idempotency.claim_ttl_millis > config.dispatcher.handler_timeout_millis);
    }
}
