//! Mock transport for testing executors without a network.

use crate::errors::{IntegrationError, IntegrationResult, TransportErrorCode};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A mock response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Headers.
    pub headers: HashMap<String, String>,
    /// Delay before responding.
    pub delay: Option<Duration>,
    /// Fail with this transport error instead of responding.
    pub failure: Option<TransportErrorCode>,
}

impl MockResponse {
    /// Creates a response with the given status and an empty body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            headers: HashMap::new(),
            delay: None,
            failure: None,
        }
    }

    /// Creates a successful response with the given body.
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self::status(200)
            .with_body(serde_json::to_string(body).unwrap_or_default())
            .with_header("content-type", "application/json")
    }

    /// Creates an error response with a JSON message.
    pub fn error(status: u16, message: &str) -> Self {
        Self::status(status).with_body(serde_json::json!({ "message": message }).to_string())
    }

    /// Creates a 429 response with a `Retry-After` in seconds.
    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        Self::status(429).with_header("retry-after", retry_after_secs.to_string())
    }

    /// Creates a token endpoint response.
    pub fn token(access_token: &str, refresh_token: Option<&str>, expires_in: u64) -> Self {
        let mut body = serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": expires_in,
        });
        if let Some(refresh) = refresh_token {
            body["refresh_token"] = serde_json::Value::String(refresh.to_string());
        }
        Self::ok(&body)
    }

    /// Creates a transport failure.
    pub fn transport_error(code: TransportErrorCode) -> Self {
        let mut response = Self::status(0);
        response.failure = Some(code);
        response
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds server rate limit headers.
    pub fn with_rate_limit(self, limit: u32, remaining: u32, reset_at: DateTime<Utc>) -> Self {
        self.with_header("x-ratelimit-limit", limit.to_string())
            .with_header("x-ratelimit-remaining", remaining.to_string())
            .with_header("x-ratelimit-reset", reset_at.timestamp().to_string())
    }

    /// Delays the response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn into_result(self) -> IntegrationResult<HttpResponse> {
        match self.failure {
            Some(code) => Err(IntegrationError::transport(
                code,
                format!("Mock transport failure: {}", code),
            )),
            None => Ok(HttpResponse::new(self.status, self.headers, self.body)),
        }
    }
}

/// Mock HTTP transport.
///
/// Responses are served from routes first (URL substring match), then
/// from the FIFO queue, then from the default response.
#[derive(Debug, Default)]
pub struct MockHttpTransport {
    routes: Mutex<Vec<(String, MockResponse)>>,
    responses: Mutex<VecDeque<MockResponse>>,
    default_response: Mutex<Option<MockResponse>>,
    request_history: Mutex<Vec<HttpRequest>>,
    request_times: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockHttpTransport {
    /// Create new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to return.
    pub fn queue_response(&self, response: MockResponse) -> &Self {
        self.responses.lock().push_back(response);
        self
    }

    /// Always answer URLs containing `pattern` with `response`.
    pub fn route(&self, pattern: impl Into<String>, response: MockResponse) -> &Self {
        self.routes.lock().push((pattern.into(), response));
        self
    }

    /// Set default response when the queue is empty.
    pub fn set_default_response(&self, response: MockResponse) -> &Self {
        *self.default_response.lock() = Some(response);
        self
    }

    /// Get request history.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.request_history.lock().clone()
    }

    /// Get last request.
    pub fn last_request(&self) -> Option<HttpRequest> {
        self.request_history.lock().last().cloned()
    }

    /// When each request arrived, in arrival order.
    pub fn request_times(&self) -> Vec<Instant> {
        self.request_times.lock().clone()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.request_history.lock().len()
    }

    /// Number of requests received for URLs containing `pattern`.
    pub fn request_count_for(&self, pattern: &str) -> usize {
        self.request_history
            .lock()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .count()
    }

    /// Highest number of simultaneously in-flight requests observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Clear request history.
    pub fn clear_history(&self) {
        self.request_history.lock().clear();
        self.request_times.lock().clear();
    }

    fn next_response(&self, url: &str) -> Option<MockResponse> {
        let routed = self
            .routes
            .lock()
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());
        routed
            .or_else(|| self.responses.lock().pop_front())
            .or_else(|| self.default_response.lock().clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> IntegrationResult<HttpResponse> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let response = self.next_response(&request.url);
        self.request_history.lock().push(request);
        self.request_times.lock().push(Instant::now());

        let response = response.ok_or_else(|| {
            IntegrationError::transport(
                TransportErrorCode::Other,
                "No mock response available",
            )
        })?;

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        response.into_result()
    }
}
