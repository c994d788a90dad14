//! Error types for the integration pipeline.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for integration operations.
pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Error kinds for categorizing integration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationErrorKind {
    /// Missing or invalid credentials, or a failed token refresh.
    Authentication,
    /// Malformed configuration or a rejected registration.
    Validation,
    /// Admission refused, or a 429 that was not replayed.
    RateLimited,
    /// Every retry attempt was consumed.
    RetryExhausted,
    /// Underlying network failure (connect, reset, DNS, timeout).
    Transport,
    /// Non-success HTTP status that was not retried.
    Http,
    /// Response body could not be decoded.
    Deserialization,
    /// No integration registered under the requested id.
    NotFound,
}

impl fmt::Display for IntegrationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Validation => write!(f, "validation"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::Transport => write!(f, "transport"),
            Self::Http => write!(f, "http"),
            Self::Deserialization => write!(f, "deserialization"),
            Self::NotFound => write!(f, "not_found"),
        }
    }
}

/// Classified transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    /// Connection refused by the peer.
    ConnectionRefused,
    /// Connection dropped mid-request.
    ConnectionReset,
    /// Dispatch exceeded its timeout.
    Timeout,
    /// Host name could not be resolved.
    DnsFailure,
    /// Any other transport failure.
    Other,
}

impl TransportErrorCode {
    /// Conventional short code for logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::ConnectionReset => "ECONNRESET",
            Self::Timeout => "ETIMEDOUT",
            Self::DnsFailure => "ENOTFOUND",
            Self::Other => "EOTHER",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integration error with classification and request context.
#[derive(Error, Debug)]
pub struct IntegrationError {
    kind: IntegrationErrorKind,
    message: String,
    integration_id: Option<String>,
    attempts: Option<u32>,
    status_code: Option<u16>,
    retry_after: Option<Duration>,
    transport_code: Option<TransportErrorCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        if let Some(code) = self.transport_code {
            write!(f, " ({})", code)?;
        }
        if let Some(ref id) = self.integration_id {
            write!(f, " [integration: {}", id)?;
            if let Some(attempts) = self.attempts {
                write!(f, ", attempts: {}", attempts)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl IntegrationError {
    /// Creates a new error.
    pub fn new(kind: IntegrationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            integration_id: None,
            attempts: None,
            status_code: None,
            retry_after: None,
            transport_code: None,
            cause: None,
        }
    }

    /// Sets the HTTP status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the server-advised wait.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Annotates the error with the owning integration and attempt count.
    ///
    /// An id that is already set is kept, so nested annotation is harmless.
    pub fn annotate(mut self, integration_id: &str, attempts: u32) -> Self {
        if self.integration_id.is_none() {
            self.integration_id = Some(integration_id.to_string());
        }
        if self.attempts.is_none() {
            self.attempts = Some(attempts);
        }
        self
    }

    /// Gets the error kind.
    pub fn kind(&self) -> IntegrationErrorKind {
        self.kind
    }

    /// Gets the message without context decoration.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the integration id the error was raised for.
    pub fn integration_id(&self) -> Option<&str> {
        self.integration_id.as_deref()
    }

    /// Gets the number of dispatch attempts made.
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// Gets the HTTP status code.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Gets the server-advised wait.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Gets the transport error code.
    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        self.transport_code
    }

    /// Gets the underlying cause as an integration error, if it is one.
    pub fn integration_cause(&self) -> Option<&IntegrationError> {
        self.cause
            .as_ref()
            .and_then(|c| c.downcast_ref::<IntegrationError>())
    }

    /// Returns true if the failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            IntegrationErrorKind::Transport => true,
            IntegrationErrorKind::Http => {
                matches!(self.status_code, Some(408) | Some(500..=599))
            }
            _ => false,
        }
    }

    /// Returns true for configuration and registration failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind,
            IntegrationErrorKind::Validation | IntegrationErrorKind::NotFound
        )
    }

    // Convenience constructors

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Authentication, message)
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Validation, message)
    }

    /// Creates a rate limit error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::RateLimited, message)
    }

    /// Creates a transport error.
    pub fn transport(code: TransportErrorCode, message: impl Into<String>) -> Self {
        let mut error = Self::new(IntegrationErrorKind::Transport, message);
        error.transport_code = Some(code);
        error
    }

    /// Creates an HTTP status error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Http, message).with_status(status)
    }

    /// Creates a retry exhaustion error wrapping the last failure.
    pub fn retry_exhausted(last: IntegrationError, attempts: u32) -> Self {
        let mut error = Self::new(
            IntegrationErrorKind::RetryExhausted,
            format!("Retries exhausted after {} attempts: {}", attempts, last.message),
        );
        error.status_code = last.status_code;
        error.transport_code = last.transport_code;
        error.attempts = Some(attempts);
        error.with_cause(last)
    }

    /// Creates a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Deserialization, message)
    }

    /// Creates an unknown-integration error.
    pub fn not_found(id: &str) -> Self {
        Self::new(
            IntegrationErrorKind::NotFound,
            format!("Integration {} is not registered", id),
        )
    }
}
