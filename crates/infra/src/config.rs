//! Configuration loading and representation.
//!
//! Every setting has a default; `from_env` overrides from `CONVOY_*`
//! variables. `from_lookup` takes any key lookup so parsing can be tested
//! without touching the process environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::RetryPolicy;
use crate::lock::LockMode;

pub const ENV_LOCK_MODE: &str = "CONVOY_LOCK_MODE";
pub const ENV_LOCK_TIMEOUT_MS: &str = "CONVOY_LOCK_TIMEOUT_MS";
pub const ENV_CALLBACK_QUEUE: &str = "CONVOY_CALLBACK_QUEUE";
pub const ENV_CALLBACK_PRIORITY: &str = "CONVOY_CALLBACK_PRIORITY";
pub const ENV_WORKER_NAME: &str = "CONVOY_WORKER_NAME";
pub const ENV_QUEUES: &str = "CONVOY_QUEUES";
pub const ENV_CONCURRENCY: &str = "CONVOY_CONCURRENCY";
pub const ENV_POLL_INTERVAL_MS: &str = "CONVOY_POLL_INTERVAL_MS";
pub const ENV_SWEEP_INTERVAL_MS: &str = "CONVOY_SWEEP_INTERVAL_MS";
pub const ENV_SWEEP_BATCH_SIZE: &str = "CONVOY_SWEEP_BATCH_SIZE";
pub const ENV_MAX_ATTEMPTS: &str = "CONVOY_MAX_ATTEMPTS";
pub const ENV_CLAIM_LEASE_MS: &str = "CONVOY_CLAIM_LEASE_MS";

/// Configuration error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, &raw, e)),
    }
}

fn parse_millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, F>(lookup, key)?.map(Duration::from_millis))
}

/// Coordinator settings shared by every process touching batches.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub lock_mode: LockMode,
    /// How long to wait for a batch lock before `LockUnavailable`.
    pub lock_timeout: Duration,
    /// Callback queue for batches that don't name one.
    pub callback_queue: String,
    /// Callback priority for batches that don't set one.
    pub callback_priority: i32,
    /// Retry policy for evaluations after a job completion report.
    pub report_retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Locked,
            lock_timeout: Duration::from_secs(5),
            callback_queue: "default".to_string(),
            callback_priority: 0,
            report_retry: RetryPolicy::fixed(3, Duration::from_millis(50)),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_callback_queue(mut self, queue: impl Into<String>) -> Self {
        self.callback_queue = queue.into();
        self
    }

    pub fn with_callback_priority(mut self, priority: i32) -> Self {
        self.callback_priority = priority;
        self
    }

    pub fn with_report_retry(mut self, policy: RetryPolicy) -> Self {
        self.report_retry = policy;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_LOCK_MODE).filter(|v| !v.trim().is_empty()) {
            config.lock_mode = raw
                .parse()
                .map_err(|e| ConfigError::invalid(ENV_LOCK_MODE, &raw, e))?;
        }
        if let Some(timeout) = parse_millis(&lookup, ENV_LOCK_TIMEOUT_MS)? {
            config.lock_timeout = timeout;
        }
        if let Some(queue) = lookup(ENV_CALLBACK_QUEUE).filter(|v| !v.trim().is_empty()) {
            config.callback_queue = queue.trim().to_string();
        }
        if let Some(priority) = parse_var(&lookup, ENV_CALLBACK_PRIORITY)? {
            config.callback_priority = priority;
        }
        Ok(config)
    }
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Queues to poll; empty means every queue
    pub queues: Vec<String>,
    /// Number of concurrent polling loops
    pub concurrency: usize,
    /// How long an idle loop sleeps before polling again
    pub poll_interval: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,
    /// Batches evaluated per sweep
    pub sweep_batch_size: usize,
    /// Retry policy for failed jobs
    pub retry_policy: RetryPolicy,
    /// How long a claimed job may run before another worker may reclaim it
    pub claim_lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "convoy-worker".to_string(),
            queues: Vec::new(),
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(30),
            sweep_batch_size: 100,
            retry_policy: RetryPolicy::default(),
            claim_lease: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(name) = lookup(ENV_WORKER_NAME).filter(|v| !v.trim().is_empty()) {
            config.name = name.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_QUEUES) {
            config.queues = raw
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty() && *q != "*")
                .map(str::to_string)
                .collect();
        }
        if let Some(concurrency) = parse_var::<usize, F>(&lookup, ENV_CONCURRENCY)? {
            if concurrency == 0 {
                return Err(ConfigError::invalid(
                    ENV_CONCURRENCY,
                    "0",
                    "must be at least 1",
                ));
            }
            config.concurrency = concurrency;
        }
        if let Some(interval) = parse_millis(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = interval;
        }
        if let Some(interval) = parse_millis(&lookup, ENV_SWEEP_INTERVAL_MS)? {
            config.sweep_interval = interval;
        }
        if let Some(size) = parse_var(&lookup, ENV_SWEEP_BATCH_SIZE)? {
            config.sweep_batch_size = size;
        }
        if let Some(attempts) = parse_var(&lookup, ENV_MAX_ATTEMPTS)? {
            config.retry_policy = config.retry_policy.with_max_attempts(attempts);
        }
        if let Some(lease) = parse_millis(&lookup, ENV_CLAIM_LEASE_MS)? {
            config.claim_lease = lease;
        }
        Ok(config)
    }
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_lock_by_default() {
        let config = CoordinatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.lock_mode, LockMode::Locked);
        assert_eq!(config.report_retry.max_attempts, 3);
    }

    #[test]
    fn coordinator_overrides_are_applied() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            (ENV_LOCK_MODE, "unlocked"),
            (ENV_LOCK_TIMEOUT_MS, "250"),
            (ENV_CALLBACK_QUEUE, " batch_callbacks "),
            (ENV_CALLBACK_PRIORITY, "-20"),
        ]))
        .unwrap();

        assert_eq!(config.lock_mode, LockMode::Unlocked);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.callback_queue, "batch_callbacks");
        assert_eq!(config.callback_priority, -20);
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = CoordinatorConfig::from_lookup(lookup(&[(ENV_LOCK_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == ENV_LOCK_TIMEOUT_MS));

        let err = CoordinatorConfig::from_lookup(lookup(&[(ENV_LOCK_MODE, "sometimes")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == ENV_LOCK_MODE));
    }

    #[test]
    fn worker_queues_split_and_wildcard_means_all() {
        let config =
            WorkerConfig::from_lookup(lookup(&[(ENV_QUEUES, "default, mail ,,")])).unwrap();
        assert_eq!(config.queues, vec!["default", "mail"]);

        let config = WorkerConfig::from_lookup(lookup(&[(ENV_QUEUES, "*")])).unwrap();
        assert!(config.queues.is_empty());
    }

    #[test]
    fn worker_rejects_zero_concurrency() {
        let err = WorkerConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == ENV_CONCURRENCY));
    }

    #[test]
    fn worker_max_attempts_feeds_retry_policy() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (ENV_MAX_ATTEMPTS, "2"),
            (ENV_SWEEP_INTERVAL_MS, "1000"),
        ]))
        .unwrap();
        assert_eq!(config.retry_policy.max_attempts, 2);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn worker_claim_lease_is_configurable() {
        assert_eq!(WorkerConfig::default().claim_lease, Duration::from_secs(300));

        let config = WorkerConfig::from_lookup(lookup(&[(ENV_CLAIM_LEASE_MS, "1500")])).unwrap();
        assert_eq!(config.claim_lease, Duration::from_millis(1500));
    }
}
