//! Endpoint catalog: per-endpoint item limits, query building, and timeout
//! scaling.
//!
//! The remote service exposes one `/query` path dispatched by a `function`
//! query parameter. How many instruments a single call may carry varies per
//! function, so chunking always looks the limit up here instead of assuming
//! a uniform value.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Symbol;
use crate::error::ApiError;

/// Logical endpoint of the remote market-data service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Quote,
    BulkQuotes,
    DailySeries,
    CompanyOverview,
    SymbolSearch,
}

impl Endpoint {
    pub const ALL: [Self; 5] = [
        Self::Quote,
        Self::BulkQuotes,
        Self::DailySeries,
        Self::CompanyOverview,
        Self::SymbolSearch,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::BulkQuotes => "bulk_quotes",
            Self::DailySeries => "daily_series",
            Self::CompanyOverview => "company_overview",
            Self::SymbolSearch => "symbol_search",
        }
    }

    /// Upstream `function` parameter value.
    pub const fn function(self) -> &'static str {
        match self {
            Self::Quote => "GLOBAL_QUOTE",
            Self::BulkQuotes => "REALTIME_BULK_QUOTES",
            Self::DailySeries => "TIME_SERIES_DAILY",
            Self::CompanyOverview => "OVERVIEW",
            Self::SymbolSearch => "SYMBOL_SEARCH",
        }
    }

    /// Rate-limit category shared by endpoints that draw on the same quota.
    pub const fn category(self) -> &'static str {
        match self {
            Self::Quote | Self::BulkQuotes => "quote",
            Self::DailySeries => "series",
            Self::CompanyOverview => "fundamentals",
            Self::SymbolSearch => "search",
        }
    }

    /// Default number of instruments one call may carry.
    pub const fn default_item_limit(self) -> usize {
        match self {
            Self::Quote | Self::DailySeries => 1,
            Self::BulkQuotes => 50,
            Self::CompanyOverview => 1,
            Self::SymbolSearch => 1,
        }
    }

    const fn symbol_param(self) -> &'static str {
        match self {
            Self::SymbolSearch => "keywords",
            _ => "symbol",
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call deadline scaled by how many instruments the call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub per_item: Duration,
    pub cap: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            per_item: Duration::from_millis(200),
            cap: Duration::from_secs(30),
        }
    }
}

impl TimeoutPolicy {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.base.is_zero() {
            return Err(ApiError::Configuration(String::from(
                "timeout base must be greater than zero",
            )));
        }
        if self.cap < self.base {
            return Err(ApiError::Configuration(String::from(
                "timeout cap must be at least the base timeout",
            )));
        }
        Ok(())
    }

    /// Deadline for a call carrying `items` instruments: base + per-item
    /// increment, capped.
    pub fn timeout_for(&self, items: usize) -> Duration {
        let scaled = self.base + self.per_item * items as u32;
        scaled.min(self.cap)
    }
}

/// Lookup table for endpoint limits and deadlines, with validated overrides.
#[derive(Debug, Clone, Default)]
pub struct EndpointCatalog {
    limits: HashMap<Endpoint, usize>,
    timeouts: TimeoutPolicy,
}

impl EndpointCatalog {
    pub fn new(timeouts: TimeoutPolicy) -> Self {
        Self {
            limits: HashMap::new(),
            timeouts,
        }
    }

    /// Override the per-call item limit for one endpoint.
    pub fn with_item_limit(mut self, endpoint: Endpoint, limit: usize) -> Result<Self, ApiError> {
        if limit == 0 {
            return Err(ApiError::Configuration(format!(
                "item limit for endpoint '{endpoint}' must be at least 1"
            )));
        }
        self.limits.insert(endpoint, limit);
        Ok(self)
    }

    pub fn item_limit(&self, endpoint: Endpoint) -> usize {
        self.limits
            .get(&endpoint)
            .copied()
            .unwrap_or_else(|| endpoint.default_item_limit())
    }

    pub fn timeout_for(&self, items: usize) -> Duration {
        self.timeouts.timeout_for(items)
    }

    pub const fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    /// Assemble the upstream URL for one call.
    pub fn build_url(
        &self,
        base_url: &str,
        endpoint: Endpoint,
        symbols: &[Symbol],
        api_key: &str,
    ) -> String {
        let joined = symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}/query?function={}&{}={}&apikey={}",
            base_url.trim_end_matches('/'),
            endpoint.function(),
            endpoint.symbol_param(),
            urlencoding::encode(&joined),
            urlencoding::encode(api_key),
        )
    }
}
