//! Resilience patterns: rate limiting, retry and bounded concurrency.

mod concurrency;
mod rate_limiter;
mod retry;

pub use concurrency::{ConcurrencyGate, GatePermit, GateStats};
pub use rate_limiter::{
    parse_retry_after, retry_after_from_headers, RateLimitStatus, RateLimitTracker,
    HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use retry::{FailureOutcome, RetryPolicy};
