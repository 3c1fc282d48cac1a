//! Circuit breaker guarding each external sensor source.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Reads flow normally.
    Closed,
    /// Reads are skipped until the cool-off elapses.
    Open,
    /// One trial read decides whether to close or reopen.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    opened_at: Option<Instant>,
    cool_off: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cool_off: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            opened_at: None,
            cool_off,
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }

    /// True while reads should be skipped. Moves to half-open once the
    /// cool-off has elapsed.
    pub fn is_open(&mut self) -> bool {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.cool_off {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state == CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Forget past failures, e.g. after the source was reconnected.
    pub fn reset(&mut self) {
        self.record_success();
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.failure_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert!(cb.is_open());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cool_off() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure();
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A failed trial reopens immediately.
        cb.record_failure();
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cb.is_open());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn reset_closes_an_open_breaker() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(600));
        cb.record_failure();
        assert!(cb.is_open());
        cb.reset();
        assert!(!cb.is_open());
    }
}
