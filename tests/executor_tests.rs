//! Integration tests for the request executor pipeline.
//!
//! All tests run against `MockHttpTransport` with a paused clock, so
//! backoff sleeps, `Retry-After` waits and cache TTLs resolve instantly.

#[cfg(test)]
mod executor_tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use integrations_core::mocks::{MockHttpTransport, MockResponse};
    use integrations_core::{
        AuthConfig, CacheConfig, EventKind, HealthCheckConfig, IntegrationConfig,
        IntegrationConfigBuilder, IntegrationErrorKind, IntegrationEvent, OAuth2Credentials,
        RateLimitConfig, RequestExecutor, RetryConfig, TransportErrorCode,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    const TOKEN_URL: &str = "https://auth.example.com/oauth/token";

    fn base_config(id: &str) -> IntegrationConfigBuilder {
        IntegrationConfig::builder()
            .id(id)
            .base_url("https://api.example.com")
    }

    fn executor(config: IntegrationConfig, transport: &Arc<MockHttpTransport>) -> RequestExecutor {
        RequestExecutor::new(config, transport.clone()).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<IntegrationEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    fn expired_oauth2() -> AuthConfig {
        AuthConfig::oauth2(
            OAuth2Credentials::new(
                "client",
                "secret",
                "https://auth.example.com/authorize",
                TOKEN_URL,
            )
            .with_tokens(
                "stale",
                Some("refresh-1".to_string()),
                Some(Utc::now() - ChronoDuration::seconds(60)),
            ),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_queues_excess_requests() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(
            MockResponse::ok(&json!({"ok": true})).with_delay(Duration::from_millis(100)),
        );
        let executor = executor(
            base_config("capped").max_concurrent_requests(2).build().unwrap(),
            &transport,
        );

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.get(&format!("/items/{}", i)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let metrics = executor.metrics();
        assert_eq!(transport.request_count(), 2);
        assert_eq!(metrics.active_requests, 2);
        assert_eq!(metrics.queued_requests, 3);

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }

        let metrics = executor.metrics();
        assert_eq!(transport.max_concurrency(), 2);
        assert_eq!(metrics.peak_active_requests, 2);
        assert_eq!(metrics.active_requests, 0);
        assert_eq!(metrics.queued_requests, 0);
        assert_eq!(metrics.successful_requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_until_exhausted() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::error(500, "boom"));
        let retry = RetryConfig::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_factor(2.0);
        let executor = executor(base_config("flaky").retry(retry).build().unwrap(), &transport);
        let mut events = executor.subscribe();

        let error = executor.get("/items").await.unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::RetryExhausted);
        assert_eq!(error.attempts(), Some(4));
        assert_eq!(error.integration_id(), Some("flaky"));
        assert_eq!(
            error.integration_cause().and_then(|cause| cause.status_code()),
            Some(500)
        );
        assert_eq!(transport.request_count(), 4);

        let times = transport.request_times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected_ms) in gaps.iter().zip([100u64, 200, 400]) {
            let expected = Duration::from_millis(expected_ms);
            assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
            assert!(*gap < expected + Duration::from_millis(10));
        }

        let delays: Vec<Duration> = drain(&mut events)
            .into_iter()
            .filter_map(|kind| match kind {
                EventKind::RetryAttempted { delay, .. } => Some(delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        let metrics = executor.metrics();
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.retried_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_transport_error_is_retried() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(MockResponse::transport_error(TransportErrorCode::ConnectionReset))
            .queue_response(MockResponse::ok(&json!({"id": 1})));
        let executor = executor(base_config("svc").build().unwrap(), &transport);

        let response = executor.get("/items/1").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.request_count(), 2);
        assert_eq!(executor.metrics().retried_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failures_surface_immediately() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(MockResponse::error(404, "missing"))
            .queue_response(MockResponse::transport_error(TransportErrorCode::Other));
        let executor = executor(base_config("svc").build().unwrap(), &transport);

        let not_found = executor.get("/items/404").await.unwrap_err();
        assert_eq!(not_found.kind(), IntegrationErrorKind::Http);
        assert_eq!(not_found.status_code(), Some(404));
        assert_eq!(not_found.attempts(), Some(1));
        assert!(not_found.message().contains("missing"));

        let other = executor.get("/items/other").await.unwrap_err();
        assert_eq!(other.kind(), IntegrationErrorKind::Transport);
        assert_eq!(other.transport_code(), Some(TransportErrorCode::Other));

        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout_is_retryable() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(
            MockResponse::status(200).with_delay(Duration::from_secs(5)),
        );
        let retry = RetryConfig::default()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(100));
        let config = base_config("slow")
            .timeout(Duration::from_secs(1))
            .retry(retry)
            .build()
            .unwrap();
        let executor = executor(config, &transport);

        let started = Instant::now();
        let error = executor.get("/slow").await.unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::RetryExhausted);
        assert_eq!(error.attempts(), Some(2));
        assert_eq!(
            error.integration_cause().and_then(|cause| cause.transport_code()),
            Some(TransportErrorCode::Timeout)
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_repeat_gets_until_ttl() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::ok(&json!({"n": 1})));
        let config = base_config("cached")
            .cache(CacheConfig::with_ttl(Duration::from_millis(1000)))
            .build()
            .unwrap();
        let executor = executor(config, &transport);
        let mut events = executor.subscribe();

        let first = executor.get("/items").await.unwrap();
        let second = executor.get("/items").await.unwrap();

        assert_eq!(first.text(), second.text());
        assert_eq!(transport.request_count(), 1);
        let metrics = executor.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 2);

        let kinds = drain(&mut events);
        assert!(matches!(kinds[0], EventKind::RequestSucceeded { status: 200, .. }));
        assert!(matches!(kinds[1], EventKind::CacheHit { .. }));

        tokio::time::advance(Duration::from_millis(1000)).await;
        executor.get("/items").await.unwrap();
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_skips_writes_and_distinguishes_query() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::ok(&json!({})));
        let config = base_config("cached")
            .cache(CacheConfig::with_ttl(Duration::from_secs(60)))
            .build()
            .unwrap();
        let executor = executor(config, &transport);

        executor.post("/items", json!({"a": 1})).await.unwrap();
        executor.post("/items", json!({"a": 1})).await.unwrap();
        executor.get_with_query("/items", &[("page", "1")]).await.unwrap();
        executor.get_with_query("/items", &[("page", "2")]).await.unwrap();
        executor.get_with_query("/items", &[("page", "1")]).await.unwrap();

        assert_eq!(transport.request_count(), 4);
        assert_eq!(executor.cache_len(), 2);

        executor.clear_cache();
        assert_eq!(executor.cache_len(), 0);
        executor.get_with_query("/items", &[("page", "1")]).await.unwrap();
        assert_eq!(transport.request_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_quota_refuses_without_dispatch() {
        let transport = Arc::new(MockHttpTransport::new());
        let reset = Utc::now() + ChronoDuration::seconds(60);
        transport
            .queue_response(MockResponse::ok(&json!({})).with_rate_limit(100, 0, reset))
            .set_default_response(MockResponse::status(200));
        let executor = executor(base_config("quota").build().unwrap(), &transport);

        executor.get("/first").await.unwrap();
        let status = executor.rate_limit_status();
        assert_eq!(status.remaining, Some(0));
        assert_eq!(status.limit, Some(100));

        let error = executor.get("/second").await.unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::RateLimited);
        assert!(error.retry_after().is_some());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_requests_is_replayed_once() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(MockResponse::too_many_requests(2))
            .queue_response(MockResponse::ok(&json!({"ok": true})));
        let config = base_config("limited")
            .rate_limit(RateLimitConfig::default())
            .build()
            .unwrap();
        let executor = executor(config, &transport);
        let mut events = executor.subscribe();

        let started = Instant::now();
        let response = executor.get("/items").await.unwrap();

        assert_eq!(response.status, 200);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.request_count(), 2);
        assert_eq!(executor.metrics().rate_limit_hits, 1);
        assert_eq!(executor.metrics().retried_requests, 0);

        let hit = drain(&mut events).into_iter().find_map(|kind| match kind {
            EventKind::RateLimitHit { retry_after, .. } => Some(retry_after),
            _ => None,
        });
        assert_eq!(hit, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_too_many_requests_surfaces() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::too_many_requests(1));
        let config = base_config("limited")
            .rate_limit(RateLimitConfig::default())
            .build()
            .unwrap();
        let executor = executor(config, &transport);

        let error = executor.get("/items").await.unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::RateLimited);
        assert_eq!(error.status_code(), Some(429));
        assert_eq!(error.attempts(), Some(2));
        assert_eq!(transport.request_count(), 2);
        assert_eq!(executor.metrics().rate_limit_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_requests_without_replay() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::too_many_requests(2));
        let ignoring = executor(
            base_config("ignoring")
                .rate_limit(RateLimitConfig {
                    respect_retry_after: false,
                    ..Default::default()
                })
                .build()
                .unwrap(),
            &transport,
        );
        let unconfigured = executor(base_config("plain").build().unwrap(), &transport);

        for executor in [ignoring, unconfigured] {
            let error = executor.get("/items").await.unwrap_err();
            assert_eq!(error.kind(), IntegrationErrorKind::RateLimited);
            assert_eq!(error.retry_after(), Some(Duration::from_secs(2)));
            assert_eq!(error.attempts(), Some(1));
        }
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_limit_is_not_slept() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::too_many_requests(600));
        let config = base_config("limited")
            .rate_limit(RateLimitConfig {
                max_retry_wait: Duration::from_secs(30),
                ..Default::default()
            })
            .build()
            .unwrap();
        let executor = executor(config, &transport);

        let started = Instant::now();
        let error = executor.get("/items").await.unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::RateLimited);
        assert_eq!(error.retry_after(), Some(Duration::from_secs(600)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_oauth2_token_refreshes_before_dispatch() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .route("/oauth/token", MockResponse::token("fresh", Some("refresh-2"), 3600))
            .set_default_response(MockResponse::ok(&json!({})));
        let executor = executor(
            base_config("oauth").auth(expired_oauth2()).no_retry().build().unwrap(),
            &transport,
        );
        let mut events = executor.subscribe();

        executor.get("/me").await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, TOKEN_URL);
        assert_eq!(
            requests[1].header_value("authorization"),
            Some("Bearer fresh")
        );

        match executor.auth_config() {
            Some(AuthConfig::OAuth2(creds)) => {
                assert!(creds.expires_at.is_some_and(|at| at > Utc::now()));
            }
            other => panic!("unexpected auth config: {:?}", other),
        }
        assert!(drain(&mut events)
            .iter()
            .any(|kind| matches!(kind, EventKind::AuthRefreshed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .route(
                "/oauth/token",
                MockResponse::token("fresh", None, 3600).with_delay(Duration::from_millis(50)),
            )
            .set_default_response(MockResponse::ok(&json!({})));
        let executor = executor(
            base_config("oauth").auth(expired_oauth2()).build().unwrap(),
            &transport,
        );

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.get(&format!("/items/{}", i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(transport.request_count_for("/oauth/token"), 1);
        let api_requests: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.url.contains("/items/"))
            .collect();
        assert_eq!(api_requests.len(), 5);
        assert!(api_requests
            .iter()
            .all(|r| r.header_value("authorization") == Some("Bearer fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_is_authentication_error() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .route("/oauth/token", MockResponse::error(400, "invalid_grant"))
            .set_default_response(MockResponse::ok(&json!({})));
        let executor = executor(
            base_config("oauth").auth(expired_oauth2()).build().unwrap(),
            &transport,
        );

        let error = executor.get("/me").await.unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::Authentication);
        assert_eq!(transport.request_count_for("/me"), 0);
        assert_eq!(executor.metrics().failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_refresh_is_bounded_by_timeout() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .route(
                "/oauth/token",
                MockResponse::token("late", None, 3600).with_delay(Duration::from_secs(3600)),
            )
            .set_default_response(MockResponse::ok(&json!({})));
        let executor = executor(
            base_config("oauth")
                .auth(expired_oauth2())
                .timeout(Duration::from_secs(1))
                .build()
                .unwrap(),
            &transport,
        );

        let start = Instant::now();
        let error = executor.get("/me").await.unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(error.kind(), IntegrationErrorKind::Authentication);
        assert_eq!(transport.request_count_for("/me"), 0);
        assert_eq!(
            transport.last_request().and_then(|r| r.timeout),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_json_decode_error_names_integration() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default_response(MockResponse::status(200).with_body("not json"));
        let executor = executor(base_config("crm").build().unwrap(), &transport);

        let error = executor
            .get_json::<serde_json::Value>("/contacts")
            .await
            .unwrap_err();

        assert_eq!(error.kind(), IntegrationErrorKind::Deserialization);
        assert_eq!(error.integration_id(), Some("crm"));
        assert_eq!(error.attempts(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_events_carry_outcome() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(MockResponse::status(201))
            .queue_response(MockResponse::error(422, "invalid"));
        let executor = executor(base_config("events").build().unwrap(), &transport);
        let mut events = executor.subscribe();

        executor.post("/items", json!({"name": "a"})).await.unwrap();
        executor.post("/items", json!({})).await.unwrap_err();

        let kinds = drain(&mut events);
        assert_eq!(kinds.len(), 2);
        match &kinds[0] {
            EventKind::RequestSucceeded { method, url, status, .. } => {
                assert_eq!(method, "POST");
                assert_eq!(url, "https://api.example.com/items");
                assert_eq!(*status, 201);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match &kinds[1] {
            EventKind::RequestFailed { attempts, error, .. } => {
                assert_eq!(*attempts, 1);
                assert!(error.contains("422"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_health_check_updates_status() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.route("/health", MockResponse::error(503, "down"));
        let config = base_config("monitored")
            .health_check(HealthCheckConfig::new("/health").interval(Duration::from_secs(10)))
            .build()
            .unwrap();
        let executor = executor(config, &transport);
        let mut events = executor.subscribe();

        executor.initialize().await.unwrap();
        assert!(executor.is_healthy());

        tokio::time::sleep(Duration::from_secs(11)).await;

        let health = executor.health();
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.is_some());
        assert_eq!(transport.request_count_for("/health"), 1);
        assert_eq!(executor.metrics().total_requests, 0);

        executor.cleanup().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.request_count_for("/health"), 1);

        let names: Vec<&str> = drain(&mut events).iter().map(EventKind::name).collect();
        assert_eq!(
            names,
            vec!["initialized", "health:checked", "cache:cleared", "shutdown"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_check_recovers_health() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(MockResponse::transport_error(TransportErrorCode::ConnectionRefused))
            .queue_response(MockResponse::status(200));
        let executor = executor(base_config("checked").build().unwrap(), &transport);

        let error = executor.test_connection().await.unwrap_err();
        assert_eq!(error.kind(), IntegrationErrorKind::Transport);
        assert!(!executor.is_healthy());

        executor.test_connection().await.unwrap();
        let health = executor.health();
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
        assert_eq!(
            transport.last_request().map(|r| r.url),
            Some("https://api.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let transport = Arc::new(MockHttpTransport::new());
        let config = base_config("bad").build().unwrap();
        let mut broken = config.clone();
        broken.max_concurrent_requests = Some(0);

        let error = RequestExecutor::new(broken, transport).unwrap_err();
        assert_eq!(error.kind(), IntegrationErrorKind::Validation);
    }
}
