//! Observability module providing metrics, health state and tracing hooks.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Metrics collector for one integration.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total requests made.
    requests_total: AtomicU64,
    /// Successful requests, cache hits included.
    requests_success: AtomicU64,
    /// Failed requests.
    requests_failed: AtomicU64,
    /// Retry dispatches.
    requests_retried: AtomicU64,
    /// 429 responses seen.
    rate_limit_hits: AtomicU64,
    /// GETs served from the cache.
    cache_hits: AtomicU64,
    /// Cache-eligible GETs that missed.
    cache_misses: AtomicU64,
    /// Total request latency in microseconds.
    latency_total_us: AtomicU64,
    /// Request count for latency calculation.
    latency_count: AtomicU64,
    /// Start of the most recent request, epoch milliseconds; 0 if none.
    last_request_ms: AtomicI64,
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.last_request_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed request.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retry dispatch.
    pub fn record_retry(&self) {
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a 429 response.
    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records request latency.
    pub fn record_latency(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the total request count.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Gets the successful request count.
    pub fn successful_requests(&self) -> u64 {
        self.requests_success.load(Ordering::Relaxed)
    }

    /// Gets the failed request count.
    pub fn failed_requests(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    /// Gets the cache hit count.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Gets the running mean response time.
    pub fn average_response_time(&self) -> Duration {
        let total = self.latency_total_us.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(total / count)
        }
    }

    /// Gets the start time of the most recent request.
    pub fn last_request_time(&self) -> Option<DateTime<Utc>> {
        match self.last_request_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Gets a snapshot of all counters. Gate figures are left at zero for
    /// the owning executor to fill in.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            retried_requests: self.requests_retried.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            average_response_time: self.average_response_time(),
            last_request_time: self.last_request_time(),
            active_requests: 0,
            peak_active_requests: 0,
            queued_requests: 0,
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.requests_success.store(0, Ordering::Relaxed);
        self.requests_failed.store(0, Ordering::Relaxed);
        self.requests_retried.store(0, Ordering::Relaxed);
        self.rate_limit_hits.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.latency_total_us.store(0, Ordering::Relaxed);
        self.latency_count.store(0, Ordering::Relaxed);
        self.last_request_ms.store(0, Ordering::Relaxed);
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Total requests.
    pub total_requests: u64,
    /// Successful requests.
    pub successful_requests: u64,
    /// Failed requests.
    pub failed_requests: u64,
    /// Retry dispatches.
    pub retried_requests: u64,
    /// 429 responses seen.
    pub rate_limit_hits: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Running mean response time.
    pub average_response_time: Duration,
    /// Start of the most recent request.
    pub last_request_time: Option<DateTime<Utc>>,
    /// Requests currently holding a concurrency slot.
    pub active_requests: usize,
    /// Highest simultaneous slot count observed.
    pub peak_active_requests: usize,
    /// Requests waiting for a slot.
    pub queued_requests: usize,
}

/// Health state of one integration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// Result of the latest check; true until a check fails.
    pub healthy: bool,
    /// Time of the latest check.
    pub last_check: Option<DateTime<Utc>>,
    /// Failure from the latest check.
    pub last_error: Option<String>,
    /// Failed checks since the last success.
    pub consecutive_failures: u32,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

impl HealthStatus {
    /// Records a check outcome.
    pub fn record(&mut self, result: Result<(), String>) {
        self.last_check = Some(Utc::now());
        match result {
            Ok(()) => {
                self.healthy = true;
                self.last_error = None;
                self.consecutive_failures = 0;
            }
            Err(error) => {
                self.healthy = false;
                self.last_error = Some(error);
                self.consecutive_failures += 1;
            }
        }
    }
}

/// Tracing hooks for pipeline operations.
pub struct TracingHooks;

impl TracingHooks {
    /// Logs the start of a request.
    pub fn on_request_start(integration_id: &str, method: &str, url: &str) {
        debug!(
            integration_id = %integration_id,
            method = %method,
            url = %url,
            "Integration request started"
        );
    }

    /// Logs the completion of a request.
    pub fn on_request_complete(
        integration_id: &str,
        method: &str,
        url: &str,
        status: u16,
        duration: Duration,
    ) {
        info!(
            integration_id = %integration_id,
            method = %method,
            url = %url,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "Integration request completed"
        );
    }

    /// Logs a request error.
    pub fn on_request_error(integration_id: &str, method: &str, url: &str, error: &str) {
        error!(
            integration_id = %integration_id,
            method = %method,
            url = %url,
            error = %error,
            "Integration request failed"
        );
    }

    /// Logs a retry attempt.
    pub fn on_retry(integration_id: &str, url: &str, attempt: u32, delay: Duration, reason: &str) {
        warn!(
            integration_id = %integration_id,
            url = %url,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Retrying integration request"
        );
    }

    /// Logs a cache hit.
    pub fn on_cache_hit(integration_id: &str, url: &str) {
        debug!(integration_id = %integration_id, url = %url, "Served from response cache");
    }

    /// Logs rate limit state learned from response headers.
    pub fn on_rate_limit_update(
        integration_id: &str,
        remaining: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
    ) {
        debug!(
            integration_id = %integration_id,
            remaining = ?remaining,
            reset_at = ?reset_at,
            "Rate limit updated"
        );
    }

    /// Logs a 429 response.
    pub fn on_rate_limit_hit(integration_id: &str, url: &str, retry_after: Duration) {
        warn!(
            integration_id = %integration_id,
            url = %url,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
    }

    /// Logs authentication token refresh.
    #[instrument(skip_all, fields(integration_id = %integration_id))]
    pub fn on_auth_token_refresh(integration_id: &str, expires_at: Option<DateTime<Utc>>) {
        info!(expires_at = ?expires_at, "Authentication token refreshed");
    }

    /// Logs a health check outcome.
    pub fn on_health_check(integration_id: &str, healthy: bool, error: Option<&str>) {
        if healthy {
            debug!(integration_id = %integration_id, "Health check passed");
        } else {
            warn!(
                integration_id = %integration_id,
                error = error.unwrap_or("unknown"),
                "Health check failed"
            );
        }
    }
}

/// Sensitive headers that should be redacted in logs.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
];

/// Redacts sensitive values in headers.
pub fn redact_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// Redacts a whole header map for logging.
pub fn redact_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), redact_header(name, value)))
        .collect()
}
