//! Typed notification stream emitted by executors.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default broadcast buffer per executor.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// `initialize()` completed.
    Initialized,
    /// A request resolved successfully.
    RequestSucceeded {
        /// Request id.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Request URL.
        url: String,
        /// Response status.
        status: u16,
        /// End-to-end duration.
        duration: Duration,
    },
    /// A request resolved with an error.
    RequestFailed {
        /// Request id.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Request URL.
        url: String,
        /// Rendered error.
        error: String,
        /// Dispatch attempts made.
        attempts: u32,
    },
    /// A GET was served from the cache.
    CacheHit {
        /// Request URL.
        url: String,
    },
    /// The server answered 429.
    RateLimitHit {
        /// Request URL.
        url: String,
        /// Wait derived from `Retry-After` or the configured default.
        retry_after: Duration,
    },
    /// A failed dispatch is being retried.
    RetryAttempted {
        /// Request id.
        request_id: String,
        /// Retry number, starting at 1.
        attempt: u32,
        /// Backoff before the retry.
        delay: Duration,
        /// Rendered failure that triggered the retry.
        reason: String,
    },
    /// OAuth2 tokens were refreshed.
    AuthRefreshed {
        /// New expiry, if the server sent one.
        expires_at: Option<DateTime<Utc>>,
    },
    /// A JWT past its expiry was attached anyway.
    AuthTokenExpired {
        /// The expiry that passed.
        expired_at: DateTime<Utc>,
    },
    /// A health check finished.
    HealthChecked {
        /// Check outcome.
        healthy: bool,
        /// Failure description when unhealthy.
        error: Option<String>,
    },
    /// The response cache was emptied.
    CacheCleared,
    /// `cleanup()` completed.
    Shutdown,
}

impl EventKind {
    /// Stable event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::RequestSucceeded { .. } => "request:success",
            Self::RequestFailed { .. } => "request:failed",
            Self::CacheHit { .. } => "cache:hit",
            Self::RateLimitHit { .. } => "rate_limit:hit",
            Self::RetryAttempted { .. } => "retry:attempted",
            Self::AuthRefreshed { .. } => "auth:refreshed",
            Self::AuthTokenExpired { .. } => "auth:token_expired",
            Self::HealthChecked { .. } => "health:checked",
            Self::CacheCleared => "cache:cleared",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A notification from one integration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationEvent {
    /// Emitting integration.
    pub integration_id: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: EventKind,
}

/// Broadcast channel for integration events.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    integration_id: String,
    sender: broadcast::Sender<IntegrationEvent>,
}

impl EventBus {
    /// Creates a bus for one integration.
    pub fn new(integration_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            integration_id: integration_id.into(),
            sender,
        }
    }

    /// Emits an event.
    pub fn emit(&self, kind: EventKind) {
        let event = IntegrationEvent {
            integration_id: self.integration_id.clone(),
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.sender.send(event);
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.sender.subscribe()
    }

    /// Current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new("crm", 8);
        let mut rx = bus.subscribe();

        bus.emit(EventKind::CacheCleared);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.integration_id, "crm");
        assert_eq!(event.kind, EventKind::CacheCleared);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new("crm", 8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(EventKind::Shutdown);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::Initialized.name(), "initialized");
        assert_eq!(
            EventKind::CacheHit { url: "u".into() }.name(),
            "cache:hit"
        );
    }
}
