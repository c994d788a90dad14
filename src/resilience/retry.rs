//! Failure classification and exponential backoff.

use crate::config::RetryConfig;
use crate::errors::{IntegrationError, IntegrationErrorKind, TransportErrorCode};
use std::time::Duration;

/// A failed dispatch as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The server answered with a non-success status.
    Status(u16),
    /// The request never produced a response.
    Transport(TransportErrorCode),
}

impl FailureOutcome {
    /// Classifies an error; only HTTP and transport failures have an outcome.
    pub fn from_error(error: &IntegrationError) -> Option<Self> {
        match error.kind() {
            IntegrationErrorKind::Http => error.status_code().map(Self::Status),
            IntegrationErrorKind::Transport => error.transport_code().map(Self::Transport),
            _ => None,
        }
    }
}

/// Retry policy with pure exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Maximum retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether a failure after `retry_count` retries should be retried.
    pub fn should_retry(&self, outcome: &FailureOutcome, retry_count: u32) -> bool {
        if retry_count >= self.config.max_retries {
            return false;
        }
        self.is_retryable(outcome)
    }

    /// Whether the outcome is retryable at all, ignoring the attempt budget.
    pub fn is_retryable(&self, outcome: &FailureOutcome) -> bool {
        match outcome {
            FailureOutcome::Status(status) => self.config.retryable_statuses.contains(status),
            FailureOutcome::Transport(code) => self.config.retryable_errors.contains(code),
        }
    }

    /// `min(initial_delay * backoff_factor^retry_count, max_delay)`, without jitter.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let initial = self.config.initial_delay.as_nanos() as f64;
        let max = self.config.max_delay.as_nanos() as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay = (initial * self.config.backoff_factor.powi(exponent)).min(max);
        Duration::from_nanos(delay.round() as u64)
    }
}
