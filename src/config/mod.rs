//! Configuration types for an integration.

use crate::auth::AuthConfig;
use crate::errors::{IntegrationError, IntegrationResult, TransportErrorCode};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = "integrations-core/0.1.0";

/// Default cache entry time-to-live.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default cache capacity.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Default wait applied to a 429 without a usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest `Retry-After` the executor will sleep through.
pub const DEFAULT_MAX_RETRY_WAIT: Duration = Duration::from_secs(300);

/// Default health check interval.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Longest cache TTL or health check interval accepted by `validate`.
pub const MAX_SCHEDULE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_factor: f64,
    /// HTTP statuses that are retried.
    pub retryable_statuses: HashSet<u16>,
    /// Transport failures that are retried.
    pub retryable_errors: HashSet<TransportErrorCode>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retryable_statuses: [408, 500, 502, 503, 504].into_iter().collect(),
            retryable_errors: [
                TransportErrorCode::ConnectionReset,
                TransportErrorCode::ConnectionRefused,
                TransportErrorCode::Timeout,
                TransportErrorCode::DnsFailure,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryConfig {
    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sleep and replay once on 429 instead of failing.
    pub respect_retry_after: bool,
    /// Wait used when a 429 has no usable `Retry-After`.
    pub default_retry_after: Duration,
    /// A `Retry-After` above this is surfaced instead of slept.
    pub max_retry_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            respect_retry_after: true,
            default_retry_after: DEFAULT_RETRY_AFTER,
            max_retry_wait: DEFAULT_MAX_RETRY_WAIT,
        }
    }
}

/// Cache eviction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionStrategy {
    /// Evict the oldest inserted entry.
    #[default]
    Fifo,
    /// Evict the least recently used entry.
    Lru,
}

/// Response cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable GET response caching.
    pub enabled: bool,
    /// Entry time-to-live.
    pub ttl: Duration,
    /// Maximum number of entries.
    pub max_size: usize,
    /// Eviction strategy once over capacity.
    pub strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: DEFAULT_CACHE_TTL,
            max_size: DEFAULT_CACHE_MAX_SIZE,
            strategy: EvictionStrategy::Fifo,
        }
    }
}

impl CacheConfig {
    /// Enabled cache with the given TTL and default capacity.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            enabled: true,
            ttl,
            ..Default::default()
        }
    }

    /// Sets the capacity.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the eviction strategy.
    pub fn strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Periodic health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Path relative to the base URL, or an absolute URL.
    pub endpoint: String,
    /// Check interval.
    pub interval: Duration,
}

impl HealthCheckConfig {
    /// Creates a health check against `endpoint` at the default interval.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    /// Sets the check interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Integration configuration.
#[derive(Debug, Clone)]
pub struct IntegrationConfig {
    /// Unique integration id.
    pub id: String,
    /// Base URL all relative paths resolve against.
    pub base_url: String,
    /// Authentication scheme.
    pub auth: Option<AuthConfig>,
    /// Server-feedback rate limiting; `None` disables 429 handling.
    pub rate_limit: Option<RateLimitConfig>,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Response cache configuration.
    pub cache: CacheConfig,
    /// Per-dispatch timeout.
    pub timeout: Duration,
    /// In-flight request cap; `None` is unbounded.
    pub max_concurrent_requests: Option<usize>,
    /// Headers merged into every request.
    pub headers: HashMap<String, String>,
    /// User-Agent header.
    pub user_agent: String,
    /// Periodic health check.
    pub health_check: Option<HealthCheckConfig>,
}

impl IntegrationConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> IntegrationConfigBuilder {
        IntegrationConfigBuilder::new()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> IntegrationResult<()> {
        if self.id.trim().is_empty() {
            return Err(IntegrationError::validation("Integration id cannot be empty"));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(IntegrationError::validation(format!(
                "Base URL must start with http:// or https://: {}",
                self.base_url
            )));
        }
        url::Url::parse(&self.base_url).map_err(|e| {
            IntegrationError::validation(format!("Invalid base URL {}: {}", self.base_url, e))
        })?;

        if self.timeout.is_zero() {
            return Err(IntegrationError::validation("Timeout must be greater than zero"));
        }

        match self.max_concurrent_requests {
            Some(0) => {
                return Err(IntegrationError::validation(
                    "max_concurrent_requests must be at least 1",
                ));
            }
            Some(n) if n > tokio::sync::Semaphore::MAX_PERMITS => {
                return Err(IntegrationError::validation(format!(
                    "max_concurrent_requests cannot exceed {}",
                    tokio::sync::Semaphore::MAX_PERMITS
                )));
            }
            _ => {}
        }

        if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
            return Err(IntegrationError::validation(
                "Backoff factor must be a finite value of at least 1.0",
            ));
        }

        if self.retry.initial_delay > self.retry.max_delay {
            return Err(IntegrationError::validation(
                "Initial retry delay cannot exceed the maximum delay",
            ));
        }

        if self.cache.enabled {
            if self.cache.max_size == 0 {
                return Err(IntegrationError::validation(
                    "Cache max_size must be at least 1",
                ));
            }
            if self.cache.ttl.is_zero() {
                return Err(IntegrationError::validation(
                    "Cache TTL must be greater than zero",
                ));
            }
            if self.cache.ttl > MAX_SCHEDULE_DURATION {
                return Err(IntegrationError::validation(format!(
                    "Cache TTL cannot exceed {}s",
                    MAX_SCHEDULE_DURATION.as_secs()
                )));
            }
        }

        if let Some(ref health) = self.health_check {
            if health.interval.is_zero() {
                return Err(IntegrationError::validation(
                    "Health check interval must be greater than zero",
                ));
            }
            if health.interval > MAX_SCHEDULE_DURATION {
                return Err(IntegrationError::validation(format!(
                    "Health check interval cannot exceed {}s",
                    MAX_SCHEDULE_DURATION.as_secs()
                )));
            }
        }

        if let Some(ref auth) = self.auth {
            auth.validate()?;
        }

        Ok(())
    }

    /// Resolves a path against the base URL. Absolute URLs pass through.
    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Builder for IntegrationConfig.
#[derive(Debug, Default)]
pub struct IntegrationConfigBuilder {
    id: Option<String>,
    base_url: Option<String>,
    auth: Option<AuthConfig>,
    rate_limit: Option<RateLimitConfig>,
    retry: Option<RetryConfig>,
    cache: Option<CacheConfig>,
    timeout: Option<Duration>,
    max_concurrent_requests: Option<usize>,
    headers: HashMap<String, String>,
    user_agent: Option<String>,
    health_check: Option<HealthCheckConfig>,
}

impl IntegrationConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the integration id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the authentication scheme.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Enables rate limit handling.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Disables retries.
    pub fn no_retry(mut self) -> Self {
        self.retry = Some(RetryConfig {
            max_retries: 0,
            ..Default::default()
        });
        self
    }

    /// Sets the cache configuration.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Sets the per-dispatch timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Caps the number of in-flight requests.
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = Some(max);
        self
    }

    /// Adds a default header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the User-Agent header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Enables the periodic health check.
    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> IntegrationResult<IntegrationConfig> {
        let config = IntegrationConfig {
            id: self.id.unwrap_or_default(),
            base_url: self.base_url.unwrap_or_default(),
            auth: self.auth,
            rate_limit: self.rate_limit,
            retry: self.retry.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            max_concurrent_requests: self.max_concurrent_requests,
            headers: self.headers,
            user_agent: self.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            health_check: self.health_check,
        };

        config.validate()?;
        Ok(config)
    }
}
