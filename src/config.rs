//! Configuration for retries, deadlines, worker pools and cache lifetimes
//!
//! A [`ResilienceConfig`] is built once at start-up (defaults, builder,
//! environment or TOML file), validated, and then shared by reference with
//! every component that needs a policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ResilienceError, Result};
use crate::retry::{Backoff, RetryPolicy};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry configuration used by operations without an override
    pub retry: RetryConfig,

    /// Per-operation retry overrides, keyed by operation name
    pub retry_overrides: HashMap<String, RetryConfig>,

    /// Deadline used by operations without an override
    pub deadline: DeadlineConfig,

    /// Per-operation deadline overrides, keyed by operation name
    pub deadline_overrides: HashMap<String, DeadlineConfig>,

    /// Bounds of the pool that deadline-bound callers wait on
    pub pool: PoolConfig,

    /// Bounds of the pool that cache computations (upstream fetches) run on
    pub fetch_pool: PoolConfig,

    /// Cache lifetimes per key space
    pub cache: CacheConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            retry_overrides: HashMap::new(),
            deadline: DeadlineConfig::default(),
            deadline_overrides: HashMap::new(),
            pool: PoolConfig::default(),
            fetch_pool: PoolConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Retry configuration for a named operation.
    pub fn retry_for(&self, operation: &str) -> &RetryConfig {
        self.retry_overrides.get(operation).unwrap_or(&self.retry)
    }

    /// Build the immutable retry policy for a named operation.
    pub fn retry_policy(&self, operation: &str) -> Result<RetryPolicy> {
        self.retry_for(operation).to_policy()
    }

    /// Deadline for a named operation.
    pub fn deadline_for(&self, operation: &str) -> Duration {
        self.deadline_overrides
            .get(operation)
            .unwrap_or(&self.deadline)
            .timeout
    }

    /// Reject configurations that can never work.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate("retry")?;
        for (name, retry) in &self.retry_overrides {
            retry.validate(name)?;
        }
        self.deadline.validate("deadline")?;
        for (name, deadline) in &self.deadline_overrides {
            deadline.validate(name)?;
        }
        self.pool.validate("pool")?;
        self.fetch_pool.validate("fetch_pool")?;
        self.cache.validate()
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: usize,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Jitter to add randomness to retries
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::invalid_config(format!(
                "{name}: max_attempts must be at least 1"
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ResilienceError::invalid_config(format!(
                "{name}: backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(ResilienceError::invalid_config(format!(
                "{name}: max_delay is shorter than initial_delay"
            )));
        }
        Ok(())
    }

    /// Validate and turn into a policy that retries every failure and every
    /// empty result.
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        self.validate("retry")?;
        let mut backoff = Backoff::exponential(
            self.initial_delay,
            self.backoff_multiplier,
            self.max_delay,
        );
        if self.jitter {
            backoff = backoff.with_jitter(0.3);
        }
        RetryPolicy::new(self.max_attempts, backoff)
    }
}

/// Deadline configuration for one named operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeadlineConfig {
    pub timeout: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
        }
    }
}

impl DeadlineConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(ResilienceError::invalid_config(format!(
                "{name}: timeout must be positive"
            )));
        }
        Ok(())
    }
}

/// Worker pool bounds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of operations running at once
    pub max_concurrency: usize,

    /// Maximum number of operations waiting for a running slot
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_concurrency: parallelism * 2,
            queue_depth: 1,
        }
    }
}

impl PoolConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ResilienceError::invalid_config(format!(
                "{name}: max_concurrency must be at least 1"
            )));
        }
        Ok(())
    }

    /// Running plus queued capacity.
    pub fn capacity(&self) -> usize {
        self.max_concurrency + self.queue_depth
    }
}

/// Cache lifetimes per key space
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of the available-areas directory
    pub areas_ttl: Duration,

    /// TTL of per-area forecast overviews
    pub forecast_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            areas_ttl: Duration::from_secs(86_400),
            forecast_ttl: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.areas_ttl.is_zero() || self.forecast_ttl.is_zero() {
            return Err(ResilienceError::invalid_config("cache: ttl must be positive"));
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ResilienceConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.retry.initial_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f32) -> Self {
        self.config.retry.backoff_multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn retry_override(mut self, operation: impl Into<String>, retry: RetryConfig) -> Self {
        self.config.retry_overrides.insert(operation.into(), retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.deadline.timeout = timeout;
        self
    }

    pub fn deadline_override(mut self, operation: impl Into<String>, timeout: Duration) -> Self {
        self.config
            .deadline_overrides
            .insert(operation.into(), DeadlineConfig { timeout });
        self
    }

    pub fn pool(mut self, max_concurrency: usize, queue_depth: usize) -> Self {
        self.config.pool = PoolConfig {
            max_concurrency,
            queue_depth,
        };
        self
    }

    pub fn fetch_pool(mut self, max_concurrency: usize, queue_depth: usize) -> Self {
        self.config.fetch_pool = PoolConfig {
            max_concurrency,
            queue_depth,
        };
        self
    }

    pub fn areas_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.areas_ttl = ttl;
        self
    }

    pub fn forecast_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.forecast_ttl = ttl;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from environment variables, starting from defaults
pub fn from_env() -> Result<ResilienceConfig> {
    let mut config = ResilienceConfig::default();

    if let Some(attempts) = env_parse::<usize>("RESILIENCE_MAX_ATTEMPTS") {
        config.retry.max_attempts = attempts;
    }

    if let Some(ms) = env_parse::<u64>("RESILIENCE_TIMEOUT_MS") {
        config.deadline.timeout = Duration::from_millis(ms);
    }

    if let Some(size) = env_parse::<usize>("RESILIENCE_POOL_SIZE") {
        config.pool.max_concurrency = size;
    }

    if let Some(depth) = env_parse::<usize>("RESILIENCE_QUEUE_DEPTH") {
        config.pool.queue_depth = depth;
    }

    if let Some(size) = env_parse::<usize>("RESILIENCE_FETCH_POOL_SIZE") {
        config.fetch_pool.max_concurrency = size;
    }

    if let Some(depth) = env_parse::<usize>("RESILIENCE_FETCH_QUEUE_DEPTH") {
        config.fetch_pool.queue_depth = depth;
    }

    if let Some(secs) = env_parse::<u64>("RESILIENCE_FORECAST_TTL_SECS") {
        config.cache.forecast_ttl = Duration::from_secs(secs);
    }

    if let Some(secs) = env_parse::<u64>("RESILIENCE_AREAS_TTL_SECS") {
        config.cache.areas_ttl = Duration::from_secs(secs);
    }

    config.validate()?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ResilienceConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ResilienceConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
