//! Consecutive-failure circuit breaker.
//!
//! Shared by the worker pool (per job type) and the stream processor (per
//! batch handler). After `failure_threshold` consecutive failures the breaker
//! opens for `cooldown`; attempts during the cool-down fail fast. The first
//! success after the cool-down closes it again.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether attempts should currently fail fast.
    ///
    /// Returns false once the cool-down has elapsed; the breaker then stays
    /// armed until the next outcome is recorded.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.opened_at {
            Some(opened_at) => opened_at.elapsed() < self.cooldown,
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_closes_on_success() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());

        // Still open within the cool-down window.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.is_open());

        // Cool-down elapsed: attempts are allowed again.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!breaker.is_open());

        // First success closes it for good.
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_cooldown_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(1));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }
}
