//! Behavior-driven tests for the rate limiter strategies.
//!
//! The three strategies share one external contract; these tests hold them
//! to it, including the trailing-window admission bound.

use std::time::{Duration, Instant};

use tickwire_core::{RateLimitConfig, RateLimitStrategy, RateLimiter};

fn config(strategy: RateLimitStrategy, max: u32, burst: u32, window: Duration) -> RateLimitConfig {
    RateLimitConfig {
        max_requests: max,
        window,
        strategy,
        burst_allowance: burst,
        enabled: true,
    }
}

// =============================================================================
// Reference scenario: five requests per window, sixth must wait
// =============================================================================

#[test]
fn sliding_window_admits_five_then_reports_the_wait_until_the_oldest_ages_out() {
    // Given: a sliding-window limiter for 5 requests per 500ms
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::SlidingWindow, 5, 0, Duration::from_millis(500)),
    );

    // When: five calls arrive in immediate succession
    let admitted_at = Instant::now();
    for call in 0..5 {
        assert_eq!(
            limiter.check_and_reserve(),
            Duration::ZERO,
            "call {call} should be admitted immediately"
        );
    }

    // Then: the sixth call waits exactly until the oldest admission exits
    let wait = limiter.check_and_reserve();
    let elapsed = admitted_at.elapsed();
    assert!(wait > Duration::ZERO);
    assert!(wait <= Duration::from_millis(500));
    // wait + time already spent ≈ full window
    let accounted = wait + elapsed;
    assert!(accounted >= Duration::from_millis(480));
    assert!(accounted <= Duration::from_millis(540));
}

#[test]
fn after_waiting_out_the_window_the_next_call_is_admitted() {
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::SlidingWindow, 2, 0, Duration::from_millis(60)),
    );

    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);
    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);

    let wait = limiter.check_and_reserve();
    assert!(wait > Duration::ZERO);

    std::thread::sleep(wait + Duration::from_millis(5));
    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);
}

// =============================================================================
// Trailing-window admission bound
// =============================================================================

fn admissions_over(limiter: &RateLimiter, run: Duration) -> Vec<Instant> {
    let started = Instant::now();
    let mut admitted = Vec::new();
    while started.elapsed() < run {
        if limiter.check_and_reserve().is_zero() {
            admitted.push(Instant::now());
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    admitted
}

fn max_in_any_trailing_window(admitted: &[Instant], window: Duration) -> usize {
    admitted
        .iter()
        .map(|end| {
            admitted
                .iter()
                .filter(|at| **at <= *end && end.duration_since(**at) < window)
                .count()
        })
        .max()
        .unwrap_or(0)
}

#[test]
fn sliding_window_never_exceeds_max_in_any_trailing_window() {
    let window = Duration::from_millis(100);
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::SlidingWindow, 5, 2, window),
    );

    let admitted = admissions_over(&limiter, Duration::from_millis(300));
    assert!(!admitted.is_empty());
    assert!(max_in_any_trailing_window(&admitted, window) <= 7);
}

#[test]
fn token_bucket_never_exceeds_max_plus_burst_in_any_trailing_window() {
    let window = Duration::from_millis(100);
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::TokenBucket, 5, 2, window),
    );

    // Drain the startup burst so the sample observes sustained admission.
    for _ in 0..7 {
        limiter.check_and_reserve();
    }

    let admitted = admissions_over(&limiter, Duration::from_millis(300));
    assert!(!admitted.is_empty());
    assert!(max_in_any_trailing_window(&admitted, window) <= 7);
}

#[test]
fn fixed_window_never_admits_more_than_max_per_window() {
    let window = Duration::from_millis(100);
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::FixedWindow, 5, 0, window),
    );

    // First window: exactly max admissions, the rest rejected.
    let mut admitted = 0;
    for _ in 0..20 {
        if limiter.check_and_reserve().is_zero() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    // Next window starts fresh.
    std::thread::sleep(window + Duration::from_millis(10));
    assert!(limiter.check_and_reserve().is_zero());
}

// =============================================================================
// Contract edges shared by all strategies
// =============================================================================

#[test]
fn every_strategy_reports_a_bounded_nonzero_wait_when_saturated() {
    for strategy in [
        RateLimitStrategy::SlidingWindow,
        RateLimitStrategy::FixedWindow,
        RateLimitStrategy::TokenBucket,
    ] {
        let limiter = RateLimiter::new(
            "quote",
            config(strategy, 3, 0, Duration::from_millis(200)),
        );

        for _ in 0..3 {
            assert_eq!(limiter.check_and_reserve(), Duration::ZERO, "{strategy}");
        }

        let wait = limiter.check_and_reserve();
        assert!(wait > Duration::ZERO, "{strategy} must report a wait");
        assert!(
            wait <= Duration::from_millis(200),
            "{strategy} wait must stay within the window"
        );
    }
}

#[test]
fn a_rejected_call_does_not_consume_capacity() {
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::SlidingWindow, 2, 0, Duration::from_millis(80)),
    );

    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);
    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);

    // Hammering a saturated limiter must not push the recovery point out.
    for _ in 0..10 {
        assert!(limiter.check_and_reserve() > Duration::ZERO);
    }

    std::thread::sleep(Duration::from_millis(90));
    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);
}

#[test]
fn disabled_limiter_always_admits_and_reports_idle_diagnostics() {
    let limiter = RateLimiter::new(
        "quote",
        RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            strategy: RateLimitStrategy::SlidingWindow,
            burst_allowance: 0,
            enabled: false,
        },
    );

    for _ in 0..100 {
        assert_eq!(limiter.check_and_reserve(), Duration::ZERO);
    }

    let snapshot = limiter.snapshot();
    assert_eq!(snapshot.utilization_pct, 0.0);
    assert_eq!(snapshot.admitted_last_second, 0);
}

#[test]
fn diagnostics_track_utilization_without_affecting_admission() {
    let limiter = RateLimiter::new(
        "quote",
        config(RateLimitStrategy::TokenBucket, 8, 0, Duration::from_secs(60)),
    );

    limiter.check_and_reserve();
    limiter.check_and_reserve();

    // Reading the snapshot repeatedly must not change what is admitted next.
    for _ in 0..5 {
        let snapshot = limiter.snapshot();
        assert!(snapshot.utilization_pct > 0.0);
        assert!(snapshot.remaining <= 6);
    }
    assert_eq!(limiter.check_and_reserve(), Duration::ZERO);
}
