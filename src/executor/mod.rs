//! Request executor: one integration's request lifecycle.
//!
//! Every call goes through the same sequence: concurrency slot, cache check
//! (GET only), authentication, then a dispatch loop in which 429 responses
//! are routed to the rate limiter and other failures to the retry policy.
//! The slot is released when the call resolves, whatever the outcome.

use crate::auth::{AuthConfig, AuthManager};
use crate::cache::{CacheKey, ResponseCache};
use crate::config::{IntegrationConfig, DEFAULT_RETRY_AFTER};
use crate::errors::{IntegrationError, IntegrationResult, TransportErrorCode};
use crate::events::{EventBus, EventKind, IntegrationEvent, DEFAULT_EVENT_CAPACITY};
use crate::observability::{redact_headers, HealthStatus, Metrics, MetricsSnapshot, TracingHooks};
use crate::resilience::{
    retry_after_from_headers, ConcurrencyGate, FailureOutcome, RateLimitStatus, RateLimitTracker,
    RetryPolicy,
};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

/// Longest response body excerpt carried in an HTTP error message.
const ERROR_BODY_EXCERPT: usize = 200;

/// Per-call state carried across retries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique id for log correlation.
    pub request_id: String,
    /// When the call started, queueing included.
    pub started_at: Instant,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Whether the one 429 replay has been used.
    pub rate_limit_replayed: bool,
    /// Whether the call was served from the cache.
    pub cache_hit: bool,
}

impl RequestContext {
    fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            retry_count: 0,
            rate_limit_replayed: false,
            cache_hit: false,
        }
    }

    /// Dispatch attempts made, the 429 replay included.
    pub fn attempts(&self) -> u32 {
        1 + self.retry_count + u32::from(self.rate_limit_replayed)
    }
}

struct Inner {
    config: IntegrationConfig,
    transport: Arc<dyn HttpTransport>,
    auth: Option<AuthManager>,
    rate_limiter: RateLimitTracker,
    retry: RetryPolicy,
    cache: Option<ResponseCache>,
    gate: ConcurrencyGate,
    metrics: Metrics,
    health: RwLock<HealthStatus>,
    events: EventBus,
    health_task: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

/// Executes requests against one external service.
///
/// Cloning is cheap; clones share cache, rate limit state, metrics and the
/// concurrency gate.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("id", &self.inner.config.id)
            .field("base_url", &self.inner.config.base_url)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Creates an executor after validating `config`.
    pub fn new(config: IntegrationConfig, transport: Arc<dyn HttpTransport>) -> IntegrationResult<Self> {
        config.validate()?;

        let events = EventBus::new(config.id.clone(), DEFAULT_EVENT_CAPACITY);
        let auth = config
            .auth
            .clone()
            .map(|auth| {
                AuthManager::new(config.id.clone(), auth, transport.clone(), events.clone())
                    .with_refresh_timeout(config.timeout)
            });
        let cache = config
            .cache
            .enabled
            .then(|| ResponseCache::from_config(&config.cache));

        Ok(Self {
            inner: Arc::new(Inner {
                retry: RetryPolicy::new(config.retry.clone()),
                gate: ConcurrencyGate::new(config.max_concurrent_requests),
                rate_limiter: RateLimitTracker::new(),
                metrics: Metrics::new(),
                health: RwLock::new(HealthStatus::default()),
                health_task: Mutex::new(None),
                initialized: AtomicBool::new(false),
                config,
                transport,
                auth,
                cache,
                events,
            }),
        })
    }

    /// Integration id.
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Configuration as supplied at construction.
    pub fn config(&self) -> &IntegrationConfig {
        &self.inner.config
    }

    /// Current credentials, refreshed tokens included.
    pub fn auth_config(&self) -> Option<AuthConfig> {
        self.inner.auth.as_ref().map(AuthManager::config)
    }

    /// Starts the health check timer and emits `Initialized`. Idempotent.
    pub async fn initialize(&self) -> IntegrationResult<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(ref health_check) = self.inner.config.health_check {
            let handle = Self::spawn_health_check(Arc::downgrade(&self.inner), health_check.interval);
            *self.inner.health_task.lock() = Some(handle);
        }

        info!(integration_id = %self.id(), "Integration initialized");
        self.inner.events.emit(EventKind::Initialized);
        Ok(())
    }

    /// Whether `initialize()` has run without a later `cleanup()`.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Stops the health check timer, clears the cache and emits `Shutdown`.
    pub async fn cleanup(&self) {
        if let Some(handle) = self.inner.health_task.lock().take() {
            handle.abort();
        }
        self.clear_cache();
        self.inner.initialized.store(false, Ordering::SeqCst);

        info!(integration_id = %self.id(), "Integration shut down");
        self.inner.events.emit(EventKind::Shutdown);
    }

    fn spawn_health_check(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(first) = Instant::now().checked_add(interval) else {
                return;
            };
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let executor = RequestExecutor { inner };
                // Outcome is recorded in the health state and event stream.
                let _ = executor.test_connection().await;
            }
        })
    }

    /// Executes a request through the full pipeline.
    #[instrument(
        skip(self, request),
        fields(
            integration_id = %self.inner.config.id,
            method = %request.method,
            url = %request.url,
            request_id = tracing::field::Empty,
        )
    )]
    pub async fn execute(&self, request: HttpRequest) -> IntegrationResult<HttpResponse> {
        let inner = &self.inner;
        let mut ctx = RequestContext::new();
        tracing::Span::current().record("request_id", ctx.request_id.as_str());

        let request = self.prepare(request);
        let method = request.method.as_str();

        let _permit = inner.gate.acquire().await?;
        inner.metrics.record_request();
        TracingHooks::on_request_start(self.id(), method, &request.url);
        debug!(headers = ?redact_headers(&request.headers), "Dispatching request");

        let result = self
            .run(&request, &mut ctx)
            .await
            .map_err(|e| e.annotate(&inner.config.id, ctx.attempts()));

        let duration = ctx.started_at.elapsed();
        inner.metrics.record_latency(duration);

        match &result {
            Ok(response) => {
                inner.metrics.record_success();
                TracingHooks::on_request_complete(self.id(), method, &request.url, response.status, duration);
                if !ctx.cache_hit {
                    inner.events.emit(EventKind::RequestSucceeded {
                        request_id: ctx.request_id.clone(),
                        method: method.to_string(),
                        url: request.url.clone(),
                        status: response.status,
                        duration,
                    });
                }
            }
            Err(error) => {
                inner.metrics.record_failure();
                TracingHooks::on_request_error(self.id(), method, &request.url, &error.to_string());
                inner.events.emit(EventKind::RequestFailed {
                    request_id: ctx.request_id.clone(),
                    method: method.to_string(),
                    url: request.url.clone(),
                    error: error.to_string(),
                    attempts: ctx.attempts(),
                });
            }
        }

        result
    }

    /// Resolves the URL and merges default headers and timeout.
    fn prepare(&self, mut request: HttpRequest) -> HttpRequest {
        let config = &self.inner.config;

        request.url = config.endpoint_url(&request.url);

        for (name, value) in &config.headers {
            if request.header_value(name).is_none() {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        if request.header_value("user-agent").is_none() {
            request
                .headers
                .insert("User-Agent".to_string(), config.user_agent.clone());
        }
        if request.timeout.is_none() {
            request.timeout = Some(config.timeout);
        }

        request
    }

    async fn run(&self, request: &HttpRequest, ctx: &mut RequestContext) -> IntegrationResult<HttpResponse> {
        let inner = &self.inner;

        let cache_key = match (&inner.cache, request.method) {
            (Some(_), HttpMethod::Get) => Some(CacheKey::from_request(request)),
            _ => None,
        };

        if let (Some(cache), Some(key)) = (&inner.cache, &cache_key) {
            if let Some(response) = cache.get(key) {
                ctx.cache_hit = true;
                inner.metrics.record_cache_hit();
                TracingHooks::on_cache_hit(self.id(), &request.url);
                inner.events.emit(EventKind::CacheHit {
                    url: request.url.clone(),
                });
                return Ok(response);
            }
            inner.metrics.record_cache_miss();
        }

        let request = match &inner.auth {
            Some(auth) => auth.authenticate(request.clone()).await?,
            None => request.clone(),
        };

        let response = self.dispatch_with_retry(&request, ctx).await?;

        if let (Some(cache), Some(key)) = (&inner.cache, cache_key) {
            cache.put(key, response.clone(), inner.config.cache.ttl);
        }

        Ok(response)
    }

    /// Dispatch loop. Each iteration is one attempt; the loop only continues
    /// after a 429 replay sleep or a retry backoff.
    async fn dispatch_with_retry(
        &self,
        request: &HttpRequest,
        ctx: &mut RequestContext,
    ) -> IntegrationResult<HttpResponse> {
        let inner = &self.inner;

        loop {
            if !inner.rate_limiter.admit() {
                return Err(self.admission_refused());
            }

            let error = match self.dispatch_once(request).await {
                Ok(response) => {
                    self.observe_rate_limit(&response);

                    if response.is_success() {
                        return Ok(response);
                    }

                    if response.status == 429 {
                        let wait = self.on_too_many_requests(request, &response);
                        let replay = inner.config.rate_limit.as_ref().is_some_and(|rl| {
                            rl.respect_retry_after && wait <= rl.max_retry_wait
                        });

                        if replay && !ctx.rate_limit_replayed {
                            ctx.rate_limit_replayed = true;
                            debug!(wait_ms = wait.as_millis() as u64, "Replaying after Retry-After");
                            tokio::time::sleep(wait).await;
                            continue;
                        }

                        return Err(IntegrationError::rate_limited(format!(
                            "Server rate limit exceeded; retry after {}s",
                            wait.as_secs()
                        ))
                        .with_status(429)
                        .with_retry_after(wait));
                    }

                    Self::status_error(&response)
                }
                Err(error) => error,
            };

            let Some(outcome) = FailureOutcome::from_error(&error) else {
                return Err(error);
            };

            if inner.retry.should_retry(&outcome, ctx.retry_count) {
                let delay = inner.retry.next_delay(ctx.retry_count);
                ctx.retry_count += 1;
                inner.metrics.record_retry();
                TracingHooks::on_retry(self.id(), &request.url, ctx.retry_count, delay, error.message());
                inner.events.emit(EventKind::RetryAttempted {
                    request_id: ctx.request_id.clone(),
                    attempt: ctx.retry_count,
                    delay,
                    reason: error.to_string(),
                });
                tokio::time::sleep(delay).await;
                continue;
            }

            if inner.retry.is_retryable(&outcome) {
                return Err(IntegrationError::retry_exhausted(error, ctx.attempts()));
            }

            return Err(error);
        }
    }

    /// One transport round trip bounded by the request timeout.
    async fn dispatch_once(&self, request: &HttpRequest) -> IntegrationResult<HttpResponse> {
        let timeout = request.timeout.unwrap_or(self.inner.config.timeout);

        match tokio::time::timeout(timeout, self.inner.transport.send(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::transport(
                TransportErrorCode::Timeout,
                format!("Request timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    fn observe_rate_limit(&self, response: &HttpResponse) {
        if self.inner.rate_limiter.update_from_headers(&response.headers) {
            let status = self.inner.rate_limiter.status();
            TracingHooks::on_rate_limit_update(self.id(), status.remaining, status.reset_time);
        }
    }

    /// Records a 429 and returns the wait it advises.
    fn on_too_many_requests(&self, request: &HttpRequest, response: &HttpResponse) -> Duration {
        let inner = &self.inner;
        let default = inner
            .config
            .rate_limit
            .as_ref()
            .map(|rl| rl.default_retry_after)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        let wait = retry_after_from_headers(&response.headers, default, Utc::now());

        inner.metrics.record_rate_limit_hit();
        TracingHooks::on_rate_limit_hit(self.id(), &request.url, wait);
        inner.events.emit(EventKind::RateLimitHit {
            url: request.url.clone(),
            retry_after: wait,
        });

        wait
    }

    fn admission_refused(&self) -> IntegrationError {
        let status = self.inner.rate_limiter.status();
        let reset = status
            .reset_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        let error = IntegrationError::rate_limited(format!(
            "Rate limit quota exhausted until {}",
            reset
        ));
        match self.inner.rate_limiter.wait_time_at(Utc::now()) {
            Some(wait) => error.with_retry_after(wait),
            None => error,
        }
    }

    fn status_error(response: &HttpResponse) -> IntegrationError {
        let body = response.text();
        let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
        let message = if excerpt.is_empty() {
            format!("Request failed with status {}", response.status)
        } else {
            format!("Request failed with status {}: {}", response.status, excerpt)
        };
        IntegrationError::http(response.status, message)
    }

    /// Calls the health endpoint (or the base URL) with credentials
    /// attached, bypassing the cache and the concurrency gate.
    pub async fn test_connection(&self) -> IntegrationResult<()> {
        let path = self
            .inner
            .config
            .health_check
            .as_ref()
            .map(|hc| hc.endpoint.as_str())
            .unwrap_or("");
        let request = self.prepare(HttpRequest::get(path));

        let result: IntegrationResult<()> = async {
            let request = match &self.inner.auth {
                Some(auth) => auth.authenticate(request).await?,
                None => request,
            };
            let response = self.dispatch_once(&request).await?;
            self.observe_rate_limit(&response);
            if response.is_success() {
                Ok(())
            } else {
                Err(Self::status_error(&response))
            }
        }
        .await;

        let outcome = result.as_ref().map(|_| ()).map_err(ToString::to_string);
        let error = outcome.as_ref().err().cloned();
        self.inner.health.write().record(outcome);

        let healthy = error.is_none();
        TracingHooks::on_health_check(self.id(), healthy, error.as_deref());
        self.inner
            .events
            .emit(EventKind::HealthChecked { healthy, error });

        result.map_err(|e| e.annotate(&self.inner.config.id, 1))
    }

    /// Empties the response cache and emits `CacheCleared`.
    pub fn clear_cache(&self) {
        if let Some(ref cache) = self.inner.cache {
            cache.clear();
        }
        self.inner.events.emit(EventKind::CacheCleared);
    }

    /// Number of cached responses.
    pub fn cache_len(&self) -> usize {
        self.inner.cache.as_ref().map(ResponseCache::len).unwrap_or(0)
    }

    /// Server-reported quota.
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.inner.rate_limiter.status()
    }

    /// Metrics snapshot including concurrency gate occupancy.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        let gate = self.inner.gate.stats();
        snapshot.active_requests = gate.active;
        snapshot.peak_active_requests = gate.peak;
        snapshot.queued_requests = gate.queued;
        snapshot
    }

    /// Resets counters.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Latest health state.
    pub fn health(&self) -> HealthStatus {
        self.inner.health.read().clone()
    }

    /// Whether the latest health check passed.
    pub fn is_healthy(&self) -> bool {
        self.inner.health.read().healthy
    }

    /// Subscribes to this integration's events.
    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.inner.events.subscribe()
    }

    /// GET `path`.
    pub async fn get(&self, path: &str) -> IntegrationResult<HttpResponse> {
        self.execute(HttpRequest::get(path)).await
    }

    /// GET `path` with query parameters, kept in the given order.
    pub async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> IntegrationResult<HttpResponse> {
        let request = query
            .iter()
            .fold(HttpRequest::get(path), |req, (k, v)| req.query_param(*k, *v));
        self.execute(request).await
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> IntegrationResult<T> {
        self.get(path)
            .await?
            .json()
            .map_err(|e| e.annotate(self.id(), 1))
    }

    /// POST a JSON body to `path`.
    pub async fn post(&self, path: &str, body: serde_json::Value) -> IntegrationResult<HttpResponse> {
        self.execute(HttpRequest::new(HttpMethod::Post, path).json(body))
            .await
    }

    /// PUT a JSON body to `path`.
    pub async fn put(&self, path: &str, body: serde_json::Value) -> IntegrationResult<HttpResponse> {
        self.execute(HttpRequest::new(HttpMethod::Put, path).json(body))
            .await
    }

    /// PATCH `path` with a JSON body.
    pub async fn patch(&self, path: &str, body: serde_json::Value) -> IntegrationResult<HttpResponse> {
        self.execute(HttpRequest::new(HttpMethod::Patch, path).json(body))
            .await
    }

    /// DELETE `path`.
    pub async fn delete(&self, path: &str) -> IntegrationResult<HttpResponse> {
        self.execute(HttpRequest::new(HttpMethod::Delete, path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockHttpTransport, MockResponse};

    fn executor(transport: Arc<MockHttpTransport>) -> RequestExecutor {
        let config = IntegrationConfig::builder()
            .id("svc")
            .base_url("https://api.example.com")
            .header("X-Tenant", "acme")
            .build()
            .unwrap();
        RequestExecutor::new(config, transport).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_merges_defaults() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::status(200));
        let executor = executor(transport.clone());

        executor
            .execute(HttpRequest::get("/items").header("x-tenant", "override"))
            .await
            .unwrap();

        let sent = transport.last_request().unwrap();
        assert_eq!(sent.url, "https://api.example.com/items");
        assert_eq!(sent.header_value("X-Tenant"), Some("override"));
        assert_eq!(sent.header_value("user-agent"), Some(crate::config::DEFAULT_USER_AGENT));
        assert_eq!(sent.timeout, Some(crate::config::DEFAULT_TIMEOUT));
    }

    #[tokio::test]
    async fn test_non_retryable_status_is_http_error() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_response(MockResponse::error(404, "missing"));
        let executor = executor(transport.clone());

        let error = executor.get("/missing").await.unwrap_err();

        assert_eq!(error.kind(), crate::errors::IntegrationErrorKind::Http);
        assert_eq!(error.status_code(), Some(404));
        assert_eq!(error.integration_id(), Some("svc"));
        assert_eq!(error.attempts(), Some(1));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(MockResponse::status(200))
            .queue_response(MockResponse::error(400, "bad"));
        let executor = executor(transport);

        executor.get("/a").await.unwrap();
        executor.get("/b").await.unwrap_err();

        let metrics = executor.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.active_requests, 0);
        assert!(metrics.last_request_time.is_some());
    }

    #[test]
    fn test_context_attempts() {
        let mut ctx = RequestContext::new();
        assert_eq!(ctx.attempts(), 1);
        ctx.retry_count = 2;
        ctx.rate_limit_replayed = true;
        assert_eq!(ctx.attempts(), 4);
    }
}
