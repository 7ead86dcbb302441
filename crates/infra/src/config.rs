//! Orchestrator configuration, read from the environment.

use std::time::Duration;

use crate::jobs::{ExecutorConfig, QueueConfig, RetryPolicy};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Every tunable of the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub lease_ttl: Duration,
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
    pub watchdog_interval: Duration,
    pub poll_interval: Duration,
    pub lock_retry_attempts: u32,
    pub lock_retry_base: Duration,
    /// Global kill switch; false forces every job into dry-run
    pub apply_enabled: bool,
    pub workers: usize,
    pub idempotency_retention: Option<Duration>,
    /// Hard cap on targets per change plan; bulk handlers chunk below it
    pub max_plan_targets: Option<usize>,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(600),
            lock_ttl: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            watchdog_interval: Duration::from_secs(900),
            poll_interval: Duration::from_millis(1000),
            lock_retry_attempts: 5,
            lock_retry_base: Duration::from_millis(200),
            apply_enabled: false,
            workers: 4,
            idempotency_retention: None,
            max_plan_targets: None,
            use_persistent_stores: false,
            database_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Read `CATALOGOPS_*`, `USE_PERSISTENT_STORES` and `DATABASE_URL`, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let config = Self {
            lease_ttl: env.secs("CATALOGOPS_LEASE_TTL_SECONDS", defaults.lease_ttl)?,
            lock_ttl: env.secs("CATALOGOPS_LOCK_TTL_SECONDS", defaults.lock_ttl)?,
            retry: RetryPolicy {
                max_attempts: env.parse("CATALOGOPS_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay: env.secs("CATALOGOPS_BACKOFF_BASE_SECONDS", defaults.retry.base_delay)?,
                max_delay: env.secs("CATALOGOPS_BACKOFF_MAX_SECONDS", defaults.retry.max_delay)?,
                jitter: env.secs("CATALOGOPS_BACKOFF_JITTER_SECONDS", defaults.retry.jitter)?,
            },
            watchdog_interval: env.secs(
                "CATALOGOPS_WATCHDOG_INTERVAL_SECONDS",
                defaults.watchdog_interval,
            )?,
            poll_interval: Duration::from_millis(env.parse(
                "CATALOGOPS_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            lock_retry_attempts: env.parse(
                "CATALOGOPS_LOCK_RETRY_ATTEMPTS",
                defaults.lock_retry_attempts,
            )?,
            lock_retry_base: Duration::from_millis(env.parse(
                "CATALOGOPS_LOCK_RETRY_BASE_MS",
                defaults.lock_retry_base.as_millis() as u64,
            )?),
            apply_enabled: env.parse("CATALOGOPS_APPLY_ENABLED", defaults.apply_enabled)?,
            workers: env.parse("CATALOGOPS_WORKERS", defaults.workers)?,
            idempotency_retention: env.days("CATALOGOPS_IDEMPOTENCY_RETENTION_DAYS")?,
            max_plan_targets: env.optional("CATALOGOPS_MAX_PLAN_TARGETS")?,
            use_persistent_stores: env.parse("USE_PERSISTENT_STORES", false)?,
            database_url: lookup("DATABASE_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::Invalid("lease TTL must be positive".to_string()));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConfigError::Invalid("lock TTL must be positive".to_string()));
        }
        // A lock must never outlive the lease of the job holding it.
        if self.lock_ttl > self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "lock TTL ({}s) exceeds lease TTL ({}s)",
                self.lock_ttl.as_secs(),
                self.lease_ttl.as_secs()
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "backoff base delay exceeds backoff max delay".to_string(),
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(ConfigError::Invalid("watchdog interval must be positive".to_string()));
        }
        if self.max_plan_targets == Some(0) {
            return Err(ConfigError::Invalid("max plan targets must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required".to_string()));
        }
        if self.use_persistent_stores && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease_ttl: self.lease_ttl,
            retry: self.retry.clone(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: self.poll_interval,
            lock_ttl: self.lock_ttl,
            lock_retry: RetryPolicy {
                max_attempts: self.lock_retry_attempts,
                base_delay: self.lock_retry_base,
                max_delay: self.lock_retry_base.saturating_mul(32),
                jitter: self.lock_retry_base,
            },
            apply_enabled: self.apply_enabled,
        }
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn optional<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(name) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| {
                ConfigError::InvalidValue {
                    name,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn secs(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .optional::<u64>(name)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }

    fn days(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        const SECS_PER_DAY: u64 = 24 * 3600;
        let Some(days) = self.optional::<u64>(name)? else {
            return Ok(None);
        };
        days.checked_mul(SECS_PER_DAY)
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| ConfigError::InvalidValue {
                name,
                value: days.to_string(),
                reason: "number of days overflows a duration".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert!(!config.apply_enabled);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.watchdog_interval, Duration::from_secs(900));
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("CATALOGOPS_LEASE_TTL_SECONDS", "120"),
            ("CATALOGOPS_LOCK_TTL_SECONDS", "60"),
            ("CATALOGOPS_MAX_ATTEMPTS", "5"),
            ("CATALOGOPS_APPLY_ENABLED", "true"),
            ("CATALOGOPS_WORKERS", "2"),
            ("CATALOGOPS_IDEMPOTENCY_RETENTION_DAYS", "30"),
        ])
        .unwrap();

        assert_eq!(config.lease_ttl, Duration::from_secs(120));
        assert_eq!(config.queue_config().lease_ttl, Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.executor_config().apply_enabled);
        assert_eq!(config.workers, 2);
        assert_eq!(config.idempotency_retention, Some(Duration::from_secs(30 * 86_400)));
    }

    #[test]
    fn rejects_lock_ttl_longer_than_lease() {
        let err = load(&[
            ("CATALOGOPS_LEASE_TTL_SECONDS", "60"),
            ("CATALOGOPS_LOCK_TTL_SECONDS", "120"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("exceeds lease TTL")));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = load(&[("CATALOGOPS_MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "CATALOGOPS_MAX_ATTEMPTS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_retention_that_overflows() {
        let max = u64::MAX.to_string();
        let err = load(&[("CATALOGOPS_IDEMPOTENCY_RETENTION_DAYS", max.as_str())]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "CATALOGOPS_IDEMPOTENCY_RETENTION_DAYS",
                ..
            }
        ));

        let config = load(&[("CATALOGOPS_IDEMPOTENCY_RETENTION_DAYS", "0")]).unwrap();
        assert_eq!(config.idempotency_retention, Some(Duration::ZERO));
    }

    #[test]
    fn plan_target_cap_is_optional_but_positive() {
        assert_eq!(load(&[]).unwrap().max_plan_targets, None);
        let config = load(&[("CATALOGOPS_MAX_PLAN_TARGETS", "1000")]).unwrap();
        assert_eq!(config.max_plan_targets, Some(1000));

        let err = load(&[("CATALOGOPS_MAX_PLAN_TARGETS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("max plan targets")));
    }

    #[test]
    fn persistent_stores_need_a_database_url() {
        let err = load(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let config = load(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/catalog"),
        ])
        .unwrap();
        assert!(config.use_persistent_stores);
    }
}
