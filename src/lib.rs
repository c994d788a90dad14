//! # Integrations Core
//!
//! A shared request-execution pipeline for third-party HTTP services:
//! - Pluggable authentication (OAuth2 with refresh, API key, Basic, JWT, custom)
//! - Server-feedback rate limiting with `Retry-After` handling
//! - Exponential backoff retry for transient failures
//! - TTL- and capacity-bound caching of GET responses
//! - FIFO-bounded concurrency
//! - Metrics, health checks and a typed event stream
//! - A registry aggregating many integrations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_core::{
//!     ApiKeyPlacement, AuthConfig, CacheConfig, IntegrationConfig, IntegrationRegistry,
//!     RequestExecutor, ReqwestTransport,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IntegrationConfig::builder()
//!         .id("crm")
//!         .base_url("https://api.example.com/v1")
//!         .auth(AuthConfig::api_key("secret", ApiKeyPlacement::header()))
//!         .cache(CacheConfig::with_ttl(Duration::from_secs(30)))
//!         .max_concurrent_requests(4)
//!         .build()?;
//!
//!     let executor = RequestExecutor::new(config, Arc::new(ReqwestTransport::new()?))?;
//!     let registry = IntegrationRegistry::new();
//!     registry.register(executor.clone()).await?;
//!
//!     let contacts: serde_json::Value = executor.get_json("/contacts").await?;
//!     println!("{}", contacts);
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Authentication
pub mod auth;

// HTTP transport
pub mod transport;

// Request pipeline
pub mod cache;
pub mod executor;
pub mod resilience;

// Registry
pub mod registry;

// Observability
pub mod events;
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{
    ApiKeyPlacement, AuthConfig, AuthHandler, AuthManager, JwtCredentials, JwtExpiryPolicy,
    OAuth2Credentials,
};
pub use cache::{CacheKey, ResponseCache};
pub use config::{
    CacheConfig, EvictionStrategy, HealthCheckConfig, IntegrationConfig,
    IntegrationConfigBuilder, RateLimitConfig, RetryConfig,
};
pub use errors::{IntegrationError, IntegrationErrorKind, IntegrationResult, TransportErrorCode};
pub use events::{EventKind, IntegrationEvent};
pub use executor::{RequestContext, RequestExecutor};
pub use observability::{HealthStatus, MetricsSnapshot};
pub use registry::{AggregateMetrics, ConnectionTestResult, IntegrationRegistry, RegistryEvent};
pub use resilience::{ConcurrencyGate, RateLimitStatus, RateLimitTracker, RetryPolicy};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
