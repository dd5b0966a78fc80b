//! Retry policy and bounded re-execution with backoff.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::ApiError;

/// Backoff schedule applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay multiplies by `multiplier` each attempt.
    Exponential,
    /// Delay follows the Fibonacci sequence scaled by the base delay.
    Fibonacci,
    /// Exponential delay scaled by the recently observed failure rate.
    Adaptive,
}

impl Backoff {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
            Self::Fibonacci => "fibonacci",
            Self::Adaptive => "adaptive",
        }
    }
}

/// Immutable retry configuration. Delays are computed per attempt, never
/// stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Multiply each delay by a uniform factor in [0.5, 1.0] so concurrent
    /// clients do not retry in lockstep.
    pub jitter: bool,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: true,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max_attempts == 0 {
            return Err(ApiError::Configuration(String::from(
                "retry max_attempts must be at least 1",
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ApiError::Configuration(format!(
                "retry multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt` (2-based: the first retry is attempt 2).
    /// `failure_rate` in [0, 1] only influences the adaptive kind.
    pub fn delay_before(&self, attempt: u32, failure_rate: f64) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exponential = |a: u32| base * self.multiplier.powi(a.saturating_sub(1) as i32);

        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * f64::from(attempt),
            Backoff::Exponential => exponential(attempt),
            Backoff::Fibonacci => base * fibonacci(attempt),
            Backoff::Adaptive => {
                exponential(attempt) * (0.5 + 1.5 * failure_rate.clamp(0.0, 1.0))
            }
        };

        let clamped = raw.clamp(0.0, self.max_delay.as_secs_f64());
        let final_secs = if self.jitter {
            clamped * (0.5 + fastrand::f64() * 0.5)
        } else {
            clamped
        };

        Duration::from_secs_f64(final_secs)
    }
}

fn fibonacci(n: u32) -> f64 {
    let (mut previous, mut current) = (0.0_f64, 1.0_f64);
    for _ in 1..n {
        let next = previous + current;
        previous = current;
        current = next;
    }
    current
}

/// Decides whether an error is worth another attempt.
pub type RetryClassifier = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Default classification straight from the error taxonomy: transient
/// network/server/rate-limit failures retry, everything else fails fast.
pub fn default_retry_classifier() -> RetryClassifier {
    Arc::new(|error: &ApiError| error.is_retryable())
}

const OUTCOME_WINDOW: usize = 20;

/// Executes operations under a [`RetryPolicy`], tracking recent outcomes to
/// feed the adaptive backoff kind.
pub struct RetryManager {
    policy: RetryPolicy,
    classifier: RetryClassifier,
    outcomes: Mutex<VecDeque<bool>>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Result<Self, ApiError> {
        policy.validate()?;
        Ok(Self {
            policy,
            classifier: default_retry_classifier(),
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
        })
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` up to `max_attempts` times. Fatal errors fail fast on
    /// first occurrence; exhausting the budget wraps the last retryable error
    /// with the attempt count and elapsed time.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    self.record_outcome(false);
                    return Ok(value);
                }
                Err(error) => {
                    if !(self.classifier)(&error) {
                        debug!(error = %error, "fatal error, not retrying");
                        return Err(error);
                    }

                    self.record_outcome(true);
                    if attempt >= self.policy.max_attempts {
                        return Err(ApiError::RetriesExhausted {
                            attempts: attempt,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            source: Box::new(error),
                        });
                    }

                    attempt += 1;
                    let delay = self
                        .policy
                        .delay_before(attempt, self.observed_failure_rate());
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Failure share across the last [`OUTCOME_WINDOW`] recorded attempts.
    pub fn observed_failure_rate(&self) -> f64 {
        let outcomes = self
            .outcomes
            .lock()
            .expect("retry outcome window lock is not poisoned");
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|failed| **failed).count();
        failures as f64 / outcomes.len() as f64
    }

    fn record_outcome(&self, failed: bool) {
        let mut outcomes = self
            .outcomes
            .lock()
            .expect("retry outcome window lock is not poisoned");
        if outcomes.len() == OUTCOME_WINDOW {
            outcomes.pop_front();
        }
        outcomes.push_back(failed);
    }
}
