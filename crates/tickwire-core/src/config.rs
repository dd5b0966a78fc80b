//! Client configuration, validated in full before any call is attempted.

use std::collections::HashMap;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::endpoint::{Endpoint, TimeoutPolicy};
use crate::error::ApiError;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.tickwire.dev";

/// Everything the client needs to know up front. Invalid values surface as
/// `ApiError::Configuration` from [`ClientConfig::validate`] at build time,
/// never mid-call.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    /// Circuit-breaker key for the upstream service.
    pub service_name: String,
    pub breaker: CircuitBreakerConfig,
    pub default_rate_limit: RateLimitConfig,
    /// Category-specific limiter overrides.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    /// Per-endpoint overrides of the max items one call may carry.
    pub item_limits: HashMap<Endpoint, usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            api_key: String::from("demo"),
            service_name: String::from("market-data"),
            breaker: CircuitBreakerConfig::default(),
            default_rate_limit: RateLimitConfig::default(),
            rate_limits: HashMap::new(),
            retry: RetryPolicy::default(),
            timeouts: TimeoutPolicy::default(),
            item_limits: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.base_url.trim().is_empty() {
            return Err(ApiError::Configuration(String::from(
                "base_url must not be empty",
            )));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ApiError::Configuration(format!(
                "base_url '{}' must start with http:// or https://",
                self.base_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(ApiError::Configuration(String::from(
                "api_key must not be empty",
            )));
        }
        if self.service_name.trim().is_empty() {
            return Err(ApiError::Configuration(String::from(
                "service_name must not be empty",
            )));
        }

        self.breaker.validate()?;
        self.default_rate_limit.validate()?;
        for (category, config) in &self.rate_limits {
            config.validate().map_err(|error| {
                ApiError::Configuration(format!("rate limit for category '{category}': {error}"))
            })?;
        }
        self.retry.validate()?;
        self.timeouts.validate()?;
        for (endpoint, limit) in &self.item_limits {
            if *limit == 0 {
                return Err(ApiError::Configuration(format!(
                    "item limit for endpoint '{endpoint}' must be at least 1"
                )));
            }
        }
        Ok(())
    }
}
