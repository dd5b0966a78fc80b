//! Per-category admission control.
//!
//! One [`RateLimiter`] guards one quota category. Three interchangeable
//! strategies share the same external contract: [`RateLimiter::check_and_reserve`]
//! returns `Duration::ZERO` when the call was admitted (and recorded), or the
//! time to wait before asking again. Admitted slots are never rolled back.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;

/// Admission algorithm used by a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

impl RateLimitStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SlidingWindow => "sliding_window",
            Self::FixedWindow => "fixed_window",
            Self::TokenBucket => "token_bucket",
        }
    }
}

impl Display for RateLimitStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limiter configuration for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub strategy: RateLimitStrategy,
    /// Extra capacity above `max_requests`, honored by the token bucket.
    pub burst_allowance: u32,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            strategy: RateLimitStrategy::SlidingWindow,
            burst_allowance: 0,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max_requests == 0 {
            return Err(ApiError::Configuration(String::from(
                "rate limit max_requests must be at least 1",
            )));
        }
        if self.window.is_zero() {
            return Err(ApiError::Configuration(String::from(
                "rate limit window must be greater than zero",
            )));
        }
        Ok(())
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum StrategyState {
    Sliding { admitted: VecDeque<Instant> },
    Fixed { window_start: Instant, count: u32 },
    Bucket { tokens: f64, last_refill: Instant },
}

#[derive(Debug)]
struct LimiterInner {
    strategy: StrategyState,
    /// Admission instants in the trailing second, diagnostics only.
    recent: VecDeque<Instant>,
}

/// Read-only diagnostics snapshot; never consulted for control flow.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub category: String,
    pub strategy: RateLimitStrategy,
    pub enabled: bool,
    pub utilization_pct: f64,
    pub remaining: u32,
    pub admitted_last_second: usize,
}

/// Thread-safe admission gate for one quota category.
pub struct RateLimiter {
    category: String,
    config: RateLimitConfig,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(category: impl Into<String>, config: RateLimitConfig) -> Self {
        let strategy = match config.strategy {
            RateLimitStrategy::SlidingWindow => StrategyState::Sliding {
                admitted: VecDeque::new(),
            },
            RateLimitStrategy::FixedWindow => StrategyState::Fixed {
                window_start: Instant::now(),
                count: 0,
            },
            RateLimitStrategy::TokenBucket => StrategyState::Bucket {
                tokens: bucket_capacity(&config),
                last_refill: Instant::now(),
            },
        };

        Self {
            category: category.into(),
            config,
            inner: Mutex::new(LimiterInner {
                strategy,
                recent: VecDeque::new(),
            }),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Try to reserve one call. `Duration::ZERO` means the call was admitted
    /// and recorded; any other value is the wait before trying again. A
    /// disabled limiter always admits without touching its state.
    pub fn check_and_reserve(&self) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }

        let mut inner = self
            .inner
            .lock()
            .expect("rate limiter lock is not poisoned");
        let now = Instant::now();

        let wait = match &mut inner.strategy {
            StrategyState::Sliding { admitted } => {
                while let Some(oldest) = admitted.front() {
                    if now.duration_since(*oldest) >= self.config.window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }

                if (admitted.len() as u32) < self.config.max_requests {
                    admitted.push_back(now);
                    Duration::ZERO
                } else {
                    let oldest = *admitted.front().expect("window is at capacity");
                    self.config.window - now.duration_since(oldest)
                }
            }
            StrategyState::Fixed {
                window_start,
                count,
            } => {
                if now.duration_since(*window_start) >= self.config.window {
                    *window_start = now;
                    *count = 0;
                }

                if *count < self.config.max_requests {
                    *count += 1;
                    Duration::ZERO
                } else {
                    self.config.window - now.duration_since(*window_start)
                }
            }
            StrategyState::Bucket {
                tokens,
                last_refill,
            } => {
                let capacity = bucket_capacity(&self.config);
                let rate = capacity / self.config.window.as_secs_f64();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rate).min(capacity);
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - *tokens) / rate)
                }
            }
        };

        if wait.is_zero() {
            inner.recent.push_back(now);
            prune_recent(&mut inner.recent, now);
            Duration::ZERO
        } else {
            // Floor keeps acquire() from busy-looping on sub-millisecond waits.
            wait.max(Duration::from_millis(1))
        }
    }

    /// Await admission, sleeping for whatever wait the limiter reports.
    pub async fn acquire(&self) {
        loop {
            let wait = self.check_and_reserve();
            if wait.is_zero() {
                return;
            }
            debug!(
                category = %self.category,
                wait_ms = wait.as_millis() as u64,
                "rate limited, waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let inner = self
            .inner
            .lock()
            .expect("rate limiter lock is not poisoned");
        let now = Instant::now();

        let (used, capacity) = match &inner.strategy {
            StrategyState::Sliding { admitted } => {
                let in_window = admitted
                    .iter()
                    .filter(|at| now.duration_since(**at) < self.config.window)
                    .count() as f64;
                (in_window, f64::from(self.config.max_requests))
            }
            StrategyState::Fixed {
                window_start,
                count,
            } => {
                let used = if now.duration_since(*window_start) >= self.config.window {
                    0.0
                } else {
                    f64::from(*count)
                };
                (used, f64::from(self.config.max_requests))
            }
            StrategyState::Bucket {
                tokens,
                last_refill,
            } => {
                let capacity = bucket_capacity(&self.config);
                let rate = capacity / self.config.window.as_secs_f64();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                let tokens_now = (*tokens + elapsed * rate).min(capacity);
                (capacity - tokens_now, capacity)
            }
        };

        let admitted_last_second = inner
            .recent
            .iter()
            .filter(|at| now.duration_since(**at) < Duration::from_secs(1))
            .count();

        RateLimitSnapshot {
            category: self.category.clone(),
            strategy: self.config.strategy,
            enabled: self.config.enabled,
            utilization_pct: if capacity > 0.0 {
                (used / capacity * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            },
            remaining: (capacity - used).max(0.0) as u32,
            admitted_last_second,
        }
    }
}

fn bucket_capacity(config: &RateLimitConfig) -> f64 {
    f64::from(config.max_requests) + f64::from(config.burst_allowance)
}

fn prune_recent(recent: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = recent.front() {
        if now.duration_since(*oldest) >= Duration::from_secs(1) {
            recent.pop_front();
        } else {
            break;
        }
    }
}

/// Map of category key to limiter, created lazily on first use.
pub struct LimiterRegistry {
    default_config: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(default_config: RateLimitConfig) -> Result<Self, ApiError> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            overrides: HashMap::new(),
            limiters: Mutex::new(HashMap::new()),
        })
    }

    /// Use a category-specific configuration instead of the default.
    pub fn with_category(
        mut self,
        category: impl Into<String>,
        config: RateLimitConfig,
    ) -> Result<Self, ApiError> {
        config.validate()?;
        self.overrides.insert(category.into(), config);
        Ok(self)
    }

    /// Limiter for `category`, creating it on first use.
    pub fn limiter(&self, category: &str) -> Arc<RateLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .expect("limiter registry lock is not poisoned");

        if let Some(existing) = limiters.get(category) {
            return Arc::clone(existing);
        }

        let config = self
            .overrides
            .get(category)
            .copied()
            .unwrap_or(self.default_config);
        let limiter = Arc::new(RateLimiter::new(category, config));
        limiters.insert(category.to_owned(), Arc::clone(&limiter));
        limiter
    }

    pub fn snapshots(&self) -> Vec<RateLimitSnapshot> {
        let limiters = self
            .limiters
            .lock()
            .expect("limiter registry lock is not poisoned");
        let mut snapshots: Vec<_> = limiters.values().map(|l| l.snapshot()).collect();
        snapshots.sort_by(|a, b| a.category.cmp(&b.category));
        snapshots
    }
}
