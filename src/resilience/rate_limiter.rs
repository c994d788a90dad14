//! Server-feedback rate limiting.
//!
//! State comes only from the latest response's `x-ratelimit-*` headers; the
//! client never estimates quota on its own.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Remaining-quota header.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Reset-epoch header.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Quota-size header.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Retry-After header.
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Point-in-time view of server-reported quota.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Remaining requests in the current window.
    pub remaining: Option<u32>,
    /// Window size, if the server reports it.
    pub limit: Option<u32>,
    /// When the window resets.
    pub reset_time: Option<DateTime<Utc>>,
}

/// Rate limit tracker fed from response headers.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    state: Mutex<RateLimitStatus>,
}

impl RateLimitTracker {
    /// Creates a tracker with no known quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the tracked state with the rate limit headers of a response.
    ///
    /// Responses without any rate limit header leave the state untouched.
    /// Returns true when the state was replaced.
    pub fn update_from_headers(&self, headers: &HashMap<String, String>) -> bool {
        let remaining = headers.get(HEADER_REMAINING);
        let reset = headers.get(HEADER_RESET);
        let limit = headers.get(HEADER_LIMIT);

        if remaining.is_none() && reset.is_none() && limit.is_none() {
            return false;
        }

        let status = RateLimitStatus {
            remaining: remaining.and_then(|v| parse_count(v)),
            limit: limit.and_then(|v| parse_count(v)),
            reset_time: reset.and_then(|v| parse_epoch(v)),
        };
        *self.state.lock() = status;
        true
    }

    /// Whether a request may be dispatched now.
    pub fn admit(&self) -> bool {
        self.admit_at(Utc::now())
    }

    /// Refuses only while the quota is spent and the reset is still ahead of `now`.
    pub fn admit_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        match (state.remaining, state.reset_time) {
            (Some(0), Some(reset)) => reset <= now,
            _ => true,
        }
    }

    /// Time left until the window resets, if quota is currently spent.
    pub fn wait_time_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.state.lock();
        match (state.remaining, state.reset_time) {
            (Some(0), Some(reset)) if reset > now => (reset - now).to_std().ok(),
            _ => None,
        }
    }

    /// Current status.
    pub fn status(&self) -> RateLimitStatus {
        self.state.lock().clone()
    }
}

fn parse_count(value: &str) -> Option<u32> {
    // Negative remainders are treated as exhausted.
    value
        .trim()
        .parse::<i64>()
        .ok()
        .map(|n| n.clamp(0, u32::MAX as i64) as u32)
}

fn parse_epoch(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single())
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP date.
///
/// Dates in the past yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(value).ok().map(|date| {
        (date.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    })
}

/// Wait advised by a 429 response, or `default` when it carries none.
pub fn retry_after_from_headers(
    headers: &HashMap<String, String>,
    default: Duration,
    now: DateTime<Utc>,
) -> Duration {
    headers
        .get(HEADER_RETRY_AFTER)
        .and_then(|v| parse_retry_after(v, now))
        .unwrap_or(default)
}
