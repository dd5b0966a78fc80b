//! # Tickwire Core
//!
//! Resilient client core for remote market-data HTTP APIs.
//!
//! ## Overview
//!
//! This crate provides the request-resilience layer a market-data client is
//! built around:
//!
//! - **Circuit breaker** per upstream service, with optional persisted state
//! - **Rate limiter** per quota category, with three admission strategies
//! - **Retry manager** with five backoff kinds and error classification
//! - **Bulk coordinator** that chunks, paces, and merges multi-symbol calls
//! - **Transport abstraction** so the network edge stays injectable
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bulk`] | Bulk validation, chunking, and merge |
//! | [`circuit_breaker`] | Circuit breaker and breaker registry |
//! | [`client`] | Client facade and builder |
//! | [`config`] | Validated configuration surface |
//! | [`domain`] | Domain types (`Symbol`) |
//! | [`endpoint`] | Endpoint catalog, item limits, timeout scaling |
//! | [`error`] | Error taxonomy |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`rate_limit`] | Rate limiter and limiter registry |
//! | [`retry`] | Retry policy and executor |
//! | [`state_store`] | Optional key-value persistence for breaker state |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tickwire_core::{ApiClient, BulkOptions, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::builder().from_env().build()?;
//!
//!     let result = client
//!         .fetch_bulk(Endpoint::BulkQuotes, &["IBM", "MSFT", "NVDA"], BulkOptions::default())
//!         .await?;
//!
//!     println!(
//!         "{} of {} symbols fetched ({:.0}%)",
//!         result.success_count,
//!         result.requested,
//!         result.success_rate() * 100.0
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Caller          │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐   chunk by endpoint limit, merge partial results
//! │ Bulk Coordinator │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐   bounded attempts, backoff, classification
//! │ Retry Manager    │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐   per-service state machine, optional persistence
//! │ Circuit Breaker  │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐   per-category admission, three strategies
//! │ Rate Limiter     │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ HTTP Transport   │
//! └──────────────────┘
//! ```
//!
//! Calls sharing a service or category key run strictly in submission order;
//! the shared counters live behind mutexes, so independent keys may proceed
//! concurrently.
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`ApiError`]. The taxonomy drives policy:
//! retryable kinds (network, server, rate-limit) feed backoff and trip the
//! breaker; caller mistakes (validation, authentication) fail fast and leave
//! the breaker untouched; an open circuit rejects before any retry budget is
//! spent.

pub mod bulk;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod http_client;
pub mod rate_limit;
pub mod retry;
pub mod state_store;

// Re-export commonly used types at the crate root for convenience

pub use bulk::{BulkOptions, BulkResult, ChunkFailure, MAX_BULK_ITEMS};
pub use circuit_breaker::{
    default_trip_classifier, BreakerRegistry, BreakerSnapshot, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, TripClassifier,
};
pub use client::{ApiClient, ApiClientBuilder, HealthSnapshot};
pub use config::ClientConfig;
pub use domain::Symbol;
pub use endpoint::{Endpoint, EndpointCatalog, TimeoutPolicy};
pub use error::{ApiError, ErrorKind};
pub use http_client::{
    HttpClient, HttpRequest, HttpResponse, NoopHttpClient, ReqwestHttpClient, TransportError,
    TransportErrorKind,
};
pub use rate_limit::{
    LimiterRegistry, RateLimitConfig, RateLimitSnapshot, RateLimitStrategy, RateLimiter,
};
pub use retry::{
    default_retry_classifier, Backoff, RetryClassifier, RetryManager, RetryPolicy,
};
pub use state_store::{InMemoryStateStore, StateStore, StoreError};
