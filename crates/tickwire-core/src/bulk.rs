//! Bulk request coordination: validate, dedupe, chunk, execute, merge.
//!
//! Chunks run strictly one after another so the shared breaker and limiter
//! state observe calls in submission order. The executor is generic over the
//! per-chunk operation; the client supplies a closure that already carries
//! retry, circuit-breaker, and rate-limit wiring.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::Symbol;
use crate::error::ApiError;

/// Absolute ceiling on items per bulk request, before chunking.
pub const MAX_BULK_ITEMS: usize = 500;

/// Tuning knobs for one bulk execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkOptions {
    /// Pause between consecutive chunks after a successful one.
    pub inter_chunk_delay: Option<Duration>,
    /// Abort on the first failing chunk instead of continuing.
    pub fail_fast: bool,
}

/// One failed chunk with the items it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub symbols: Vec<Symbol>,
    pub error: ApiError,
}

/// Merged outcome of a bulk execution. Partial failure is expressed here,
/// never as an error; callers inspect the counts.
#[derive(Debug, Clone)]
pub struct BulkResult<T> {
    pub items: Vec<T>,
    /// Deduplicated item count this execution set out to fetch.
    pub requested: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<ChunkFailure>,
}

impl<T> BulkResult<T> {
    pub fn success_rate(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.requested as f64
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Validate, parse, and deduplicate raw symbols, preserving first-seen order.
pub fn normalize_items<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Symbol>, ApiError> {
    if raw.is_empty() {
        return Err(ApiError::Validation(String::from(
            "bulk request must include at least one symbol",
        )));
    }
    if raw.len() > MAX_BULK_ITEMS {
        return Err(ApiError::Validation(format!(
            "bulk request carries {} symbols, limit is {MAX_BULK_ITEMS}",
            raw.len()
        )));
    }

    let mut seen = HashSet::with_capacity(raw.len());
    let mut symbols = Vec::with_capacity(raw.len());
    for input in raw {
        let symbol = Symbol::parse(input.as_ref())?;
        if seen.insert(symbol.clone()) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}

/// Split symbols into order-preserving chunks of at most `limit` items.
pub fn chunk_items(symbols: &[Symbol], limit: usize) -> Vec<Vec<Symbol>> {
    symbols
        .chunks(limit.max(1))
        .map(<[Symbol]>::to_vec)
        .collect()
}

/// Run every chunk sequentially and merge the results.
///
/// `run_chunk` receives the chunk index and its symbols. Failures are
/// recorded per chunk; only zero successful chunks turns into an error.
pub async fn execute_chunks<T, F, Fut>(
    symbols: Vec<Symbol>,
    chunk_limit: usize,
    options: BulkOptions,
    mut run_chunk: F,
) -> Result<BulkResult<T>, ApiError>
where
    F: FnMut(usize, Vec<Symbol>) -> Fut,
    Fut: Future<Output = Result<Vec<T>, ApiError>>,
{
    let requested = symbols.len();

    // Single item: skip the chunk bookkeeping and pacing entirely.
    if requested == 1 {
        let carried = symbols.clone();
        return match run_chunk(0, symbols).await {
            Ok(items) => Ok(BulkResult {
                items,
                requested,
                success_count: 1,
                failure_count: 0,
                failures: Vec::new(),
            }),
            Err(error) => Err(ApiError::BulkFailed {
                failures: vec![ChunkFailure {
                    chunk_index: 0,
                    symbols: carried,
                    error,
                }],
            }),
        };
    }

    let chunks = chunk_items(&symbols, chunk_limit);
    let total_chunks = chunks.len();
    debug!(requested, total_chunks, chunk_limit, "starting bulk execution");

    let mut items = Vec::new();
    let mut success_count = 0usize;
    let mut failures = Vec::new();

    for (index, chunk) in chunks.into_iter().enumerate() {
        let chunk_size = chunk.len();
        let carried = chunk.clone();

        match run_chunk(index, chunk).await {
            Ok(mut payload) => {
                success_count += chunk_size;
                items.append(&mut payload);

                if index + 1 < total_chunks {
                    if let Some(delay) = options.inter_chunk_delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            Err(error) => {
                warn!(
                    chunk = index,
                    symbols = chunk_size,
                    error = %error,
                    "bulk chunk failed"
                );
                failures.push(ChunkFailure {
                    chunk_index: index,
                    symbols: carried,
                    error,
                });

                if options.fail_fast {
                    break;
                }
            }
        }
    }

    if success_count == 0 {
        return Err(ApiError::BulkFailed { failures });
    }

    let failure_count = failures.iter().map(|f| f.symbols.len()).sum();
    Ok(BulkResult {
        items,
        requested,
        success_count,
        failure_count,
        failures,
    })
}
