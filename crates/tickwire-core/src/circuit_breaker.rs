//! Circuit breaker guarding upstream calls, one instance per service key.
//!
//! The breaker cycles `Closed -> Open -> HalfOpen -> Closed`. Only errors the
//! configured classifier counts as trip-worthy move the failure counter;
//! caller mistakes (validation, authentication) never open the circuit.
//! State can optionally be persisted through a [`StateStore`] so a restart
//! does not forget an open circuit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApiError, ErrorKind};
use crate::state_store::StateStore;

/// Runtime circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive trip-worthy failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing probes.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Concurrent probes permitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.failure_threshold == 0 {
            return Err(ApiError::Configuration(String::from(
                "circuit failure threshold must be at least 1",
            )));
        }
        if self.success_threshold == 0 {
            return Err(ApiError::Configuration(String::from(
                "circuit success threshold must be at least 1",
            )));
        }
        if self.half_open_max_probes == 0 {
            return Err(ApiError::Configuration(String::from(
                "circuit must allow at least one half-open probe",
            )));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ApiError::Configuration(String::from(
                "circuit recovery timeout must be greater than zero",
            )));
        }
        Ok(())
    }
}

/// Decides whether a failure counts toward opening the circuit.
pub type TripClassifier = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Default classification: upstream trouble trips, caller mistakes do not.
pub fn default_trip_classifier() -> TripClassifier {
    Arc::new(|error| {
        matches!(
            error.kind(),
            ErrorKind::Network | ErrorKind::Server | ErrorKind::RateLimited
        )
    })
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_probes: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_probes: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Persisted snapshot of breaker state; in-flight probe counts are not
/// carried across restarts.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_epoch_ms: Option<i64>,
    last_success_epoch_ms: Option<i64>,
}

/// Read-only diagnostics snapshot; never consulted for control flow.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub open_remaining_ms: Option<u64>,
}

/// Thread-safe circuit breaker for one named upstream service.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    classifier: TripClassifier,
    store: Option<Arc<dyn StateStore>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            classifier: default_trip_classifier(),
            store: None,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: TripClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Attach a persistence backend and hydrate from it when it holds a
    /// live entry for this service.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self.restore();
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Gate one call. `Ok` reserves the call (and a probe slot when
    /// half-open); `Err` is `ApiError::CircuitOpen` with the remaining wait.
    pub fn try_acquire(&self) -> Result<(), ApiError> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_max_probes {
                    inner.half_open_probes += 1;
                    Ok(())
                } else {
                    Err(self.open_error(&inner))
                }
            }
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_probes = 1;
                    debug!(service = %self.service, "circuit half-open, probing upstream");
                    self.persist_locked(&inner);
                    Ok(())
                } else {
                    Err(self.open_error(&inner))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.last_success_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.half_open_probes = 0;
                    debug!(service = %self.service, "circuit closed after successful probes");
                }
            }
            CircuitState::Open => {}
        }

        self.persist_locked(&inner);
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.last_failure_at = Some(Instant::now());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.consecutive_successes = 0;
                    inner.half_open_probes = 0;
                    warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                inner.half_open_probes = 0;
                warn!(service = %self.service, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }

        self.persist_locked(&inner);
    }

    /// Record an error according to the trip classifier. Non-tripping errors
    /// only release the probe slot they were holding.
    pub fn record_outcome(&self, error: &ApiError) {
        if (self.classifier)(error) {
            self.record_failure();
        } else {
            self.release_probe();
        }
    }

    /// Run `operation` through the breaker: gate, execute, classify, record.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_outcome(&error);
                Err(error)
            }
        }
    }

    /// Like [`execute`](Self::execute) but substitutes a fallback value for
    /// any failure, including an open circuit.
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, operation: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        FB: FnOnce() -> T,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(error) => {
                debug!(service = %self.service, error = %error, "serving fallback");
                fallback()
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        let open_remaining_ms = match inner.state {
            CircuitState::Open => inner.last_failure_at.map(|at| {
                self.config
                    .recovery_timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64
            }),
            _ => None,
        };

        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            open_remaining_ms,
        }
    }

    fn release_probe(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
        }
    }

    fn open_error(&self, inner: &BreakerInner) -> ApiError {
        let retry_after_ms = inner
            .last_failure_at
            .map(|at| {
                self.config
                    .recovery_timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64
            })
            .unwrap_or(0);

        ApiError::CircuitOpen {
            service: self.service.clone(),
            retry_after_ms,
        }
    }

    fn store_key(&self) -> String {
        format!("circuit:{}", self.service)
    }

    fn persist_locked(&self, inner: &BreakerInner) {
        let Some(store) = &self.store else {
            return;
        };

        let now_ms = epoch_ms_now();
        let persisted = PersistedState {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_epoch_ms: inner
                .last_failure_at
                .map(|at| now_ms - at.elapsed().as_millis() as i64),
            last_success_epoch_ms: inner
                .last_success_at
                .map(|at| now_ms - at.elapsed().as_millis() as i64),
        };

        let payload = match serde_json::to_string(&persisted) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(service = %self.service, %error, "could not serialize circuit state");
                return;
            }
        };

        let ttl = self.config.recovery_timeout * 2;
        if let Err(error) = store.set(&self.store_key(), payload, ttl) {
            warn!(service = %self.service, %error, "could not persist circuit state");
        }
    }

    fn restore(&mut self) {
        let Some(store) = &self.store else {
            return;
        };

        let payload = match store.get(&self.store_key()) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(error) => {
                warn!(service = %self.service, %error, "could not read persisted circuit state");
                return;
            }
        };

        let persisted: PersistedState = match serde_json::from_str(&payload) {
            Ok(persisted) => persisted,
            Err(error) => {
                warn!(service = %self.service, %error, "ignoring malformed persisted circuit state");
                return;
            }
        };

        let inner = self
            .inner
            .get_mut()
            .expect("circuit breaker lock is not poisoned");
        inner.state = persisted.state;
        inner.consecutive_failures = persisted.consecutive_failures;
        inner.consecutive_successes = persisted.consecutive_successes;
        inner.half_open_probes = 0;
        inner.last_failure_at = persisted.last_failure_epoch_ms.map(instant_from_epoch_ms);
        inner.last_success_at = persisted.last_success_epoch_ms.map(instant_from_epoch_ms);
        debug!(service = %self.service, state = ?inner.state, "restored circuit state");
    }
}

fn epoch_ms_now() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn instant_from_epoch_ms(then_ms: i64) -> Instant {
    let elapsed_ms = (epoch_ms_now() - then_ms).max(0) as u64;
    Instant::now()
        .checked_sub(Duration::from_millis(elapsed_ms))
        .unwrap_or_else(Instant::now)
}

/// Map of service name to breaker, created lazily on first use.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    classifier: TripClassifier,
    store: Option<Arc<dyn StateStore>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ApiError> {
        config.validate()?;
        Ok(Self {
            config,
            classifier: default_trip_classifier(),
            store: None,
            breakers: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_classifier(mut self, classifier: TripClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Breaker for `service`, creating (and hydrating) it on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");

        if let Some(existing) = breakers.get(service) {
            return Arc::clone(existing);
        }

        let mut breaker = CircuitBreaker::new(service, self.config)
            .with_classifier(Arc::clone(&self.classifier));
        if let Some(store) = &self.store {
            breaker = breaker.with_store(Arc::clone(store));
        }

        let breaker = Arc::new(breaker);
        breakers.insert(service.to_owned(), Arc::clone(&breaker));
        breaker
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}
