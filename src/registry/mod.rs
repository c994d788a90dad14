//! Registry of executors with aggregated health and metrics.

use crate::errors::{IntegrationError, IntegrationResult};
use crate::events::{EventKind, IntegrationEvent};
use crate::executor::RequestExecutor;
use crate::observability::{HealthStatus, MetricsSnapshot};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Broadcast buffer for registry events.
pub const DEFAULT_REGISTRY_EVENT_CAPACITY: usize = 1024;

/// How long `unregister` waits for the final events to be forwarded.
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Registry-level notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// An integration was registered and initialized.
    Registered {
        /// Integration id.
        id: String,
    },
    /// An integration was cleaned up and removed.
    Unregistered {
        /// Integration id.
        id: String,
    },
    /// An event forwarded from a registered integration.
    Integration(IntegrationEvent),
}

/// Outcome of one connection test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTestResult {
    /// Whether the test succeeded.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
    /// Test duration.
    pub duration: Duration,
}

/// Totals across every registered integration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    /// Registered integrations.
    pub integrations: usize,
    /// Integrations whose latest check passed.
    pub healthy_integrations: usize,
    /// Total requests.
    pub total_requests: u64,
    /// Successful requests.
    pub successful_requests: u64,
    /// Failed requests.
    pub failed_requests: u64,
    /// 429 responses seen.
    pub rate_limit_hits: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Mean response time weighted by request count.
    pub average_response_time: Duration,
}

struct Registration {
    executor: RequestExecutor,
    registered_at: DateTime<Utc>,
    forwarder: JoinHandle<()>,
}

/// Registers executors by id and aggregates their state.
pub struct IntegrationRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    // Ids whose registration is in progress.
    pending: Mutex<HashSet<String>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DEFAULT_REGISTRY_EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            events,
        }
    }

    fn duplicate(id: &str) -> IntegrationError {
        IntegrationError::validation(format!("Integration {} is already registered", id))
    }

    /// Initializes `executor` and registers it under its id.
    ///
    /// Fails with a validation error if the id is taken or being registered
    /// concurrently; the registry and the executor are left untouched then.
    pub async fn register(&self, executor: RequestExecutor) -> IntegrationResult<()> {
        let id = executor.id().to_string();
        self.reserve(&id)?;

        let events = executor.subscribe();
        if let Err(e) = executor.initialize().await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        let forwarder = self.spawn_forwarder(events);

        self.entries.write().insert(
            id.clone(),
            Registration {
                executor,
                registered_at: Utc::now(),
                forwarder,
            },
        );
        self.pending.lock().remove(&id);

        info!(integration_id = %id, "Integration registered");
        let _ = self.events.send(RegistryEvent::Registered { id });
        Ok(())
    }

    /// Claims `id` for an in-progress registration.
    fn reserve(&self, id: &str) -> IntegrationResult<()> {
        let entries = self.entries.read();
        let mut pending = self.pending.lock();
        if entries.contains_key(id) || !pending.insert(id.to_string()) {
            return Err(Self::duplicate(id));
        }
        Ok(())
    }

    fn spawn_forwarder(
        &self,
        mut events: broadcast::Receiver<IntegrationEvent>,
    ) -> JoinHandle<()> {
        let sender = self.events.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let shutdown = matches!(event.kind, EventKind::Shutdown);
                        let _ = sender.send(RegistryEvent::Integration(event));
                        if shutdown {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Registry event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Cleans up and removes the integration registered under `id`.
    pub async fn unregister(&self, id: &str) -> IntegrationResult<()> {
        let registration = self
            .entries
            .write()
            .remove(id)
            .ok_or_else(|| IntegrationError::not_found(id))?;

        registration.executor.cleanup().await;

        let mut forwarder = registration.forwarder;
        if tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, &mut forwarder)
            .await
            .is_err()
        {
            forwarder.abort();
        }

        info!(integration_id = %id, "Integration unregistered");
        let _ = self.events.send(RegistryEvent::Unregistered { id: id.to_string() });
        Ok(())
    }

    /// Unregisters every integration.
    pub async fn shutdown(&self) {
        for id in self.ids() {
            if let Err(e) = self.unregister(&id).await {
                warn!(integration_id = %id, error = %e, "Failed to unregister during shutdown");
            }
        }
    }

    /// Tests every integration concurrently. Failures are reported per id.
    pub async fn test_all_connections(&self) -> HashMap<String, ConnectionTestResult> {
        let executors = self.executors();

        let checks = executors.into_iter().map(|(id, executor)| async move {
            let started = Instant::now();
            let result = executor.test_connection().await;
            let outcome = ConnectionTestResult {
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                duration: started.elapsed(),
            };
            (id, outcome)
        });

        join_all(checks).await.into_iter().collect()
    }

    fn executors(&self) -> Vec<(String, RequestExecutor)> {
        self.entries
            .read()
            .iter()
            .map(|(id, registration)| (id.clone(), registration.executor.clone()))
            .collect()
    }

    /// Executor registered under `id`.
    pub fn get(&self, id: &str) -> Option<RequestExecutor> {
        self.entries.read().get(id).map(|r| r.executor.clone())
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// When `id` was registered.
    pub fn registered_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.read().get(id).map(|r| r.registered_at)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered integrations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Subscribes to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Metrics per integration.
    pub fn metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.executors()
            .into_iter()
            .map(|(id, executor)| (id, executor.metrics()))
            .collect()
    }

    /// Health per integration.
    pub fn health(&self) -> HashMap<String, HealthStatus> {
        self.executors()
            .into_iter()
            .map(|(id, executor)| (id, executor.health()))
            .collect()
    }

    /// Totals across all integrations.
    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let mut aggregate = AggregateMetrics::default();
        let mut weighted_us: u128 = 0;

        for (_, executor) in self.executors() {
            let snapshot = executor.metrics();
            aggregate.integrations += 1;
            if executor.is_healthy() {
                aggregate.healthy_integrations += 1;
            }
            aggregate.total_requests += snapshot.total_requests;
            aggregate.successful_requests += snapshot.successful_requests;
            aggregate.failed_requests += snapshot.failed_requests;
            aggregate.rate_limit_hits += snapshot.rate_limit_hits;
            aggregate.cache_hits += snapshot.cache_hits;
            aggregate.cache_misses += snapshot.cache_misses;
            weighted_us +=
                snapshot.average_response_time.as_micros() * u128::from(snapshot.total_requests);
        }

        if aggregate.total_requests > 0 {
            let mean = weighted_us / u128::from(aggregate.total_requests);
            aggregate.average_response_time =
                Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX));
        }

        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegrationConfig;
    use crate::mocks::{MockHttpTransport, MockResponse};
    use std::sync::Arc;

    fn executor(id: &str, transport: Arc<MockHttpTransport>) -> RequestExecutor {
        let config = IntegrationConfig::builder()
            .id(id)
            .base_url("https://api.example.com")
            .build()
            .unwrap();
        RequestExecutor::new(config, transport).unwrap()
    }

    #[tokio::test]
    async fn test_register_initializes_executor() {
        let registry = IntegrationRegistry::new();
        let executor = executor("crm", Arc::new(MockHttpTransport::new()));

        registry.register(executor.clone()).await.unwrap();

        assert!(executor.is_initialized());
        assert!(registry.contains("crm"));
        assert!(registry.registered_at("crm").is_some());
        assert_eq!(registry.ids(), vec!["crm".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_id_is_reserved() {
        let registry = IntegrationRegistry::new();
        registry.reserve("crm").unwrap();

        let error = registry
            .register(executor("crm", Arc::new(MockHttpTransport::new())))
            .await
            .unwrap_err();

        assert!(error.is_validation());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_id_fails() {
        let registry = IntegrationRegistry::new();
        let error = registry.unregister("ghost").await.unwrap_err();
        assert!(error.is_validation());
    }

    #[tokio::test]
    async fn test_unregister_cleans_up() {
        let registry = IntegrationRegistry::new();
        let executor = executor("crm", Arc::new(MockHttpTransport::new()));
        registry.register(executor.clone()).await.unwrap();

        registry.unregister("crm").await.unwrap();

        assert!(registry.is_empty());
        assert!(!executor.is_initialized());
    }

    #[tokio::test]
    async fn test_aggregate_metrics() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::status(200));
        let registry = IntegrationRegistry::new();
        let a = executor("a", transport.clone());
        let b = executor("b", transport);
        registry.register(a.clone()).await.unwrap();
        registry.register(b.clone()).await.unwrap();

        a.get("/x").await.unwrap();
        b.get("/y").await.unwrap();
        b.get("/z").await.unwrap();

        let aggregate = registry.aggregate_metrics();
        assert_eq!(aggregate.integrations, 2);
        assert_eq!(aggregate.healthy_integrations, 2);
        assert_eq!(aggregate.total_requests, 3);
        assert_eq!(aggregate.successful_requests, 3);
        assert_eq!(registry.metrics()["b"].total_requests, 2);
    }
}
