use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Single trial call after the cooldown; its outcome closes or reopens the breaker.
    Trial,
    Rejected,
}

/// Run-scoped circuit breaker for the remote evaluator.
///
/// Opens once the run's evaluator failures exceed `threshold`, so `threshold` failures are
/// tolerated and the next one trips it. Without a cooldown it stays open for the rest of the
/// run; with one, a single trial call is admitted after the cooldown elapses.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: usize,
    cooldown: Option<Duration>,
    failures: usize,
    state: BreakerState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, cooldown: Option<Duration>) -> Self {
        Self {
            threshold,
            cooldown,
            failures: 0,
            state: BreakerState::Closed,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn admit(&mut self) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Rejected,
            BreakerState::Open => {
                let cooled = match (self.cooldown, self.opened_at) {
                    (Some(cooldown), Some(opened_at)) => opened_at.elapsed() >= cooldown,
                    _ => false,
                };
                if cooled && !self.trial_in_flight {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    info!("evaluator breaker half-open; admitting a trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Late successes from calls admitted before the breaker opened leave it open.
    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            info!("evaluator trial call succeeded; breaker closed");
            self.failures = 0;
            self.state = BreakerState::Closed;
            self.opened_at = None;
            self.trial_in_flight = false;
        }
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        match self.state {
            BreakerState::HalfOpen => {
                warn!("evaluator trial call failed; breaker reopened");
                self.open();
                true
            }
            BreakerState::Closed if self.failures > self.threshold => {
                warn!(failures = self.failures, "evaluator failure threshold exceeded; breaker open");
                self.open();
                true
            }
            _ => false,
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_once_failures_exceed_threshold_and_stays_open_without_cooldown() {
        let mut breaker = CircuitBreaker::new(2, None);
        assert_eq!(breaker.admit(), Admission::Allowed);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.failures(), 3);
        assert_eq!(breaker.state(), BreakerState::Open);
        for _ in 0..5 {
            assert_eq!(breaker.admit(), Admission::Rejected);
        }
    }

    #[test]
    fn successes_do_not_reset_the_run_failure_count() {
        let mut breaker = CircuitBreaker::new(2, None);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_success();
        assert!(breaker.record_failure());
        assert_eq!(breaker.failures(), 3);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_call_closes_or_reopens() {
        let mut breaker = CircuitBreaker::new(0, Some(Duration::from_secs(60)));
        assert!(breaker.record_failure());
        assert_eq!(breaker.admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.admit(), Admission::Trial);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // only one trial call at a time
        assert_eq!(breaker.admit(), Admission::Rejected);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.admit(), Admission::Trial);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }
}
