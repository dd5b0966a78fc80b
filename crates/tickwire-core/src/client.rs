//! Client facade wiring every call through the resilience chain.
//!
//! One [`ApiClient`] owns the breaker and limiter registries, the retry
//! manager, the endpoint catalog, and the injected transport. A call flows
//! chunk -> retry -> circuit breaker -> rate limiter -> transport; the pieces
//! never reach around each other.

use std::env;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::bulk::{self, BulkOptions, BulkResult};
use crate::circuit_breaker::{BreakerRegistry, BreakerSnapshot, TripClassifier};
use crate::config::ClientConfig;
use crate::domain::Symbol;
use crate::endpoint::{Endpoint, EndpointCatalog};
use crate::error::ApiError;
use crate::http_client::{HttpClient, HttpRequest, NoopHttpClient, ReqwestHttpClient};
use crate::rate_limit::{LimiterRegistry, RateLimitSnapshot};
use crate::retry::{RetryClassifier, RetryManager};
use crate::state_store::StateStore;

/// Read-only view over breaker and limiter diagnostics, for health checks
/// and dashboards. Control flow never consults it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub service: String,
    pub breakers: Vec<BreakerSnapshot>,
    pub limiters: Vec<RateLimitSnapshot>,
}

/// Builder for [`ApiClient`]. API keys come from explicit configuration or,
/// with [`from_env`](Self::from_env), the `TICKWIRE_API_KEY` /
/// `MARKETDATA_API_KEY` environment variables.
#[derive(Default)]
pub struct ApiClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn HttpClient>>,
    store: Option<Arc<dyn StateStore>>,
    trip_classifier: Option<TripClassifier>,
    retry_classifier: Option<RetryClassifier>,
}

impl ApiClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the API key from the environment, leaving the configured default
    /// in place when neither variable is set.
    pub fn from_env(mut self) -> Self {
        if let Ok(key) = env::var("TICKWIRE_API_KEY").or_else(|_| env::var("MARKETDATA_API_KEY")) {
            self.config.api_key = key;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = api_key.into();
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use the no-op transport: deterministic, offline, no key required.
    pub fn with_mock_transport(mut self) -> Self {
        self.transport = Some(Arc::new(NoopHttpClient));
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_breaker_config(
        mut self,
        breaker: crate::circuit_breaker::CircuitBreakerConfig,
    ) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn with_trip_classifier(mut self, classifier: TripClassifier) -> Self {
        self.trip_classifier = Some(classifier);
        self
    }

    pub fn with_default_rate_limit(mut self, config: crate::rate_limit::RateLimitConfig) -> Self {
        self.config.default_rate_limit = config;
        self
    }

    pub fn with_rate_limit(
        mut self,
        category: impl Into<String>,
        config: crate::rate_limit::RateLimitConfig,
    ) -> Self {
        self.config.rate_limits.insert(category.into(), config);
        self
    }

    pub fn with_retry_policy(mut self, policy: crate::retry::RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn with_retry_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.retry_classifier = Some(classifier);
        self
    }

    pub fn with_timeouts(mut self, timeouts: crate::endpoint::TimeoutPolicy) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn with_item_limit(mut self, endpoint: Endpoint, limit: usize) -> Self {
        self.config.item_limits.insert(endpoint, limit);
        self
    }

    /// Validate the whole configuration and assemble the client.
    pub fn build(self) -> Result<ApiClient, ApiError> {
        self.config.validate()?;

        let mut catalog = EndpointCatalog::new(self.config.timeouts);
        for (endpoint, limit) in &self.config.item_limits {
            catalog = catalog.with_item_limit(*endpoint, *limit)?;
        }

        let mut breakers = BreakerRegistry::new(self.config.breaker)?;
        if let Some(classifier) = self.trip_classifier {
            breakers = breakers.with_classifier(classifier);
        }
        if let Some(store) = self.store {
            breakers = breakers.with_store(store);
        }

        let mut limiters = LimiterRegistry::new(self.config.default_rate_limit)?;
        for (category, config) in &self.config.rate_limits {
            limiters = limiters.with_category(category.clone(), *config)?;
        }

        let mut retry = RetryManager::new(self.config.retry)?;
        if let Some(classifier) = self.retry_classifier {
            retry = retry.with_classifier(classifier);
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));

        Ok(ApiClient {
            config: self.config,
            catalog,
            transport,
            breakers,
            limiters,
            retry,
        })
    }
}

/// Resilient client for the remote market-data service.
pub struct ApiClient {
    config: ClientConfig,
    catalog: EndpointCatalog,
    transport: Arc<dyn HttpClient>,
    breakers: BreakerRegistry,
    limiters: LimiterRegistry,
    retry: RetryManager,
}

impl ApiClient {
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    /// Issue one call for up to the endpoint's per-call item limit.
    pub async fn fetch(
        &self,
        endpoint: Endpoint,
        symbols: &[Symbol],
    ) -> Result<Vec<Value>, ApiError> {
        if symbols.is_empty() {
            return Err(ApiError::Validation(String::from(
                "request must include at least one symbol",
            )));
        }
        let limit = self.catalog.item_limit(endpoint);
        if symbols.len() > limit {
            return Err(ApiError::Validation(format!(
                "endpoint '{endpoint}' accepts at most {limit} symbols per call, got {}; use fetch_bulk",
                symbols.len()
            )));
        }

        self.call_with_resilience(endpoint, symbols.to_vec()).await
    }

    /// Execute a multi-item request: validate, dedupe, chunk to the
    /// endpoint's limit, run chunks sequentially through the resilience
    /// chain, and merge the partial outcomes.
    pub async fn fetch_bulk<S: AsRef<str>>(
        &self,
        endpoint: Endpoint,
        raw_symbols: &[S],
        options: BulkOptions,
    ) -> Result<BulkResult<Value>, ApiError> {
        let symbols = bulk::normalize_items(raw_symbols)?;
        let chunk_limit = self.catalog.item_limit(endpoint);

        bulk::execute_chunks(symbols, chunk_limit, options, |index, chunk| {
            debug!(endpoint = %endpoint, chunk = index, items = chunk.len(), "running bulk chunk");
            self.call_with_resilience(endpoint, chunk)
        })
        .await
    }

    /// Diagnostics for dashboards and health endpoints.
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            service: self.config.service_name.clone(),
            breakers: self.breakers.snapshots(),
            limiters: self.limiters.snapshots(),
        }
    }

    async fn call_with_resilience(
        &self,
        endpoint: Endpoint,
        symbols: Vec<Symbol>,
    ) -> Result<Vec<Value>, ApiError> {
        let breaker = self.breakers.breaker(&self.config.service_name);
        let limiter = self.limiters.limiter(endpoint.category());
        let timeout = self.catalog.timeout_for(symbols.len());
        let url = self
            .catalog
            .build_url(&self.config.base_url, endpoint, &symbols, &self.config.api_key);

        self.retry
            .execute(|| {
                let breaker = Arc::clone(&breaker);
                let limiter = Arc::clone(&limiter);
                let url = url.clone();
                async move {
                    breaker
                        .execute(|| async move {
                            limiter.acquire().await;

                            let request = HttpRequest::new(url).with_timeout(timeout);
                            let invocation =
                                tokio::time::timeout(timeout, self.transport.invoke(request));
                            let response = match invocation.await {
                                Ok(Ok(response)) => response,
                                Ok(Err(transport_error)) => return Err(transport_error.into()),
                                Err(_) => {
                                    return Err(ApiError::Network(format!(
                                        "call exceeded its {}ms deadline",
                                        timeout.as_millis()
                                    )))
                                }
                            };

                            if !response.is_success() {
                                return Err(ApiError::from_status(response.status, &response.body));
                            }

                            parse_payload(&response.body)
                        })
                        .await
                }
            })
            .await
    }
}

/// Extract the payload items from an upstream body: a bare array, an object
/// with a `data` array, or a single object.
fn parse_payload(body: &str) -> Result<Vec<Value>, ApiError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ApiError::Network(format!("malformed upstream payload: {e}")))?;

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                Ok(items.clone())
            } else {
                Ok(vec![Value::Object(map)])
            }
        }
        other => Ok(vec![other]),
    }
}
