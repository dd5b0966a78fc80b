//! End-to-end tests for the full resilience chain:
//! retry -> circuit breaker -> rate limiter -> transport.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tickwire_core::{
    ApiClient, ApiError, Backoff, BulkOptions, CircuitBreakerConfig, CircuitState, Endpoint,
    ErrorKind, HttpClient, HttpRequest, HttpResponse, RateLimitConfig, RateLimitStrategy,
    RetryPolicy, Symbol, TimeoutPolicy, TransportError,
};

/// Pops one scripted response per call; serves 200 `{}` once the script is
/// exhausted.
struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpClient for ScriptedTransport {
    fn invoke<'a>(
        &'a self,
        _request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .expect("script lock is not poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::ok_json("{}")));
        Box::pin(async move { next })
    }
}

fn status(code: u16) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: code,
        body: format!(r#"{{"status":{code}}}"#),
    })
}

fn ok_body(body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::ok_json(body))
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Backoff::Fixed,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter: false,
        multiplier: 2.0,
    }
}

fn symbol(raw: &str) -> Vec<Symbol> {
    vec![Symbol::parse(raw).expect("valid symbol")]
}

// =============================================================================
// Retry through the chain
// =============================================================================

#[tokio::test]
async fn transient_transport_failures_are_absorbed_by_retries() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(TransportError::connect("connection refused")),
        ok_body(r#"{"symbol":"IBM","price":232.4}"#),
    ]));
    let client = ApiClient::builder()
        .with_transport(Arc::clone(&transport))
        .with_retry_policy(fast_retry(3))
        .build()
        .expect("valid test configuration");

    let payload = client
        .fetch(Endpoint::Quote, &symbol("IBM"))
        .await
        .expect("second attempt succeeds");

    assert_eq!(transport.calls(), 2);
    assert_eq!(payload[0]["price"], 232.4);
}

#[tokio::test]
async fn upstream_429_is_retried_and_then_succeeds() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        status(429),
        ok_body(r#"{"symbol":"IBM"}"#),
    ]));
    let client = ApiClient::builder()
        .with_transport(Arc::clone(&transport))
        .with_retry_policy(fast_retry(3))
        .build()
        .expect("valid test configuration");

    let payload = client
        .fetch(Endpoint::Quote, &symbol("IBM"))
        .await
        .expect("retry absorbs the rate-limit response");

    assert_eq!(transport.calls(), 2);
    assert_eq!(payload.len(), 1);
}

// =============================================================================
// Breaker opens after exhausted retries, then fails fast
// =============================================================================

#[tokio::test]
async fn exhausted_retries_open_the_circuit_and_block_the_next_call() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        status(500),
        status(500),
        status(500),
    ]));
    let client = ApiClient::builder()
        .with_transport(Arc::clone(&transport))
        .with_retry_policy(fast_retry(3))
        .with_breaker_config(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
            half_open_max_probes: 1,
        })
        .build()
        .expect("valid test configuration");

    // First call burns its whole retry budget against 500s.
    let first = client.fetch(Endpoint::Quote, &symbol("IBM")).await;
    let error = first.expect_err("all attempts failed");
    assert!(matches!(error, ApiError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(error.kind(), ErrorKind::Server);
    assert_eq!(transport.calls(), 3);

    let health = client.health();
    assert_eq!(health.breakers[0].state, CircuitState::Open);

    // Second call fails fast: no retry budget spent, no transport call made.
    let second = client.fetch(Endpoint::Quote, &symbol("IBM")).await;
    assert!(matches!(second, Err(ApiError::CircuitOpen { .. })));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn authentication_failures_fail_fast_and_leave_the_circuit_closed() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        status(401),
        ok_body(r#"{"symbol":"IBM"}"#),
    ]));
    let client = ApiClient::builder()
        .with_transport(Arc::clone(&transport))
        .with_retry_policy(fast_retry(5))
        .build()
        .expect("valid test configuration");

    let first = client.fetch(Endpoint::Quote, &symbol("IBM")).await;
    assert!(matches!(first, Err(ApiError::Authentication(_))));
    assert_eq!(transport.calls(), 1, "auth errors must not be retried");

    // The circuit never saw a trip-worthy failure, so the next call proceeds.
    let second = client.fetch(Endpoint::Quote, &symbol("IBM")).await;
    assert!(second.is_ok());
    assert_eq!(client.health().breakers[0].state, CircuitState::Closed);
}

// =============================================================================
// Rate limiting inside the chain
// =============================================================================

#[tokio::test]
async fn saturated_category_delays_the_next_call_instead_of_failing() {
    let client = ApiClient::builder()
        .with_transport(Arc::new(ScriptedTransport::new(Vec::new())))
        .with_retry_policy(RetryPolicy::no_retry())
        .with_rate_limit(
            "quote",
            RateLimitConfig {
                max_requests: 1,
                window: Duration::from_millis(50),
                strategy: RateLimitStrategy::SlidingWindow,
                burst_allowance: 0,
                enabled: true,
            },
        )
        .build()
        .expect("valid test configuration");

    let started = Instant::now();
    client
        .fetch(Endpoint::Quote, &symbol("IBM"))
        .await
        .expect("first call admitted immediately");
    client
        .fetch(Endpoint::Quote, &symbol("MSFT"))
        .await
        .expect("second call admitted after the window frees up");

    assert!(started.elapsed() >= Duration::from_millis(40));
}

// =============================================================================
// Per-call deadline
// =============================================================================

struct StalledTransport;

impl HttpClient for StalledTransport {
    fn invoke<'a>(
        &'a self,
        _request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HttpResponse::ok_json("{}"))
        })
    }
}

#[tokio::test]
async fn a_stalled_transport_call_times_out_as_a_retryable_failure() {
    let client = ApiClient::builder()
        .with_transport(Arc::new(StalledTransport))
        .with_retry_policy(RetryPolicy::no_retry())
        .with_timeouts(TimeoutPolicy {
            base: Duration::from_millis(30),
            per_item: Duration::from_millis(1),
            cap: Duration::from_millis(50),
        })
        .build()
        .expect("valid test configuration");

    let started = Instant::now();
    let result = client.fetch(Endpoint::Quote, &symbol("IBM")).await;

    let error = result.expect_err("deadline must cut the call off");
    assert_eq!(error.kind(), ErrorKind::Network);
    assert!(error.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(2));
}

// =============================================================================
// Idempotence and isolation
// =============================================================================

#[tokio::test]
async fn repeating_a_single_item_bulk_call_yields_independent_results() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        ok_body(r#"[{"symbol":"IBM"}]"#),
        ok_body(r#"[{"symbol":"IBM"}]"#),
    ]));
    let client = ApiClient::builder()
        .with_transport(Arc::clone(&transport))
        .with_retry_policy(RetryPolicy::no_retry())
        .build()
        .expect("valid test configuration");

    for _ in 0..2 {
        let result = client
            .fetch_bulk(Endpoint::BulkQuotes, &["IBM"], BulkOptions::default())
            .await
            .expect("single-item bulk succeeds");
        assert_eq!(result.requested, 1);
        assert_eq!(result.success_count, 1);
        assert!((result.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    assert_eq!(transport.calls(), 2);
    assert_eq!(client.health().breakers[0].state, CircuitState::Closed);
}

#[tokio::test]
async fn separate_clients_share_no_breaker_or_limiter_state() {
    let failing = ApiClient::builder()
        .with_transport(Arc::new(ScriptedTransport::new(vec![
            status(500),
            status(500),
        ])))
        .with_retry_policy(fast_retry(2))
        .with_breaker_config(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
            half_open_max_probes: 1,
        })
        .build()
        .expect("valid test configuration");
    let healthy = ApiClient::builder()
        .with_transport(Arc::new(ScriptedTransport::new(Vec::new())))
        .with_retry_policy(RetryPolicy::no_retry())
        .build()
        .expect("valid test configuration");

    let _ = failing.fetch(Endpoint::Quote, &symbol("IBM")).await;
    assert_eq!(failing.health().breakers[0].state, CircuitState::Open);

    // The other client's registry is untouched by the first one's failures.
    let result = healthy.fetch(Endpoint::Quote, &symbol("IBM")).await;
    assert!(result.is_ok());
    assert_eq!(healthy.health().breakers[0].state, CircuitState::Closed);
}
