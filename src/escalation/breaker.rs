//! Per-channel circuit breaker.
//!
//! Lock-free: consecutive failures, the open-until instant and the
//! half-open trial flag are atomics. Time comes from the caller so the
//! injected clock drives cooldowns.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use chrono::{DateTime, TimeZone, Utc};

use crate::config::BreakerConfig;

/// Sentinel for "not open".
const CLOSED: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Cooldown elapsed; the next call is a trial.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Holds the half-open trial slot. Dropping it unsettled (the trial call
/// was abandoned before reporting) frees the slot for the next caller.
#[must_use]
#[derive(Debug)]
pub struct TrialGuard<'a> {
    breaker: Option<&'a CircuitBreaker>,
}

impl TrialGuard<'_> {
    /// The trial reported through `record_success` or `record_failure`.
    pub fn settle(mut self) {
        self.breaker = None;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Whether a call may go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Closed,
    /// The single call admitted after a cooldown.
    Trial,
    Rejected { retry_in: chrono::Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    open_until_ms: AtomicI64,
    trial_in_flight: AtomicBool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            failures: AtomicU32::new(0),
            open_until_ms: AtomicI64::new(CLOSED),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        if open_until == CLOSED {
            CircuitState::Closed
        } else if now.timestamp_millis() < open_until {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// When the current cooldown ends, if the circuit has been opened.
    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        match self.open_until_ms.load(Ordering::Acquire) {
            CLOSED => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Decide whether a call may proceed. After the cooldown exactly one
    /// caller wins the trial slot; the rest are rejected until it reports.
    pub fn admit(&self, now: DateTime<Utc>) -> Admission {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        if open_until == CLOSED {
            return Admission::Closed;
        }
        let now_ms = now.timestamp_millis();
        if now_ms < open_until {
            return Admission::Rejected {
                retry_in: chrono::Duration::milliseconds(open_until - now_ms),
            };
        }
        match self
            .trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Admission::Trial,
            Err(_) => Admission::Rejected {
                retry_in: chrono::Duration::zero(),
            },
        }
    }

    /// Guard for a slot won through `Admission::Trial`.
    pub fn hold_trial(&self) -> TrialGuard<'_> {
        TrialGuard {
            breaker: Some(self),
        }
    }

    /// Close the circuit.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.open_until_ms.store(CLOSED, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Count a failure; opens (or re-opens) the circuit once the threshold
    /// is reached or when the trial call fails.
    pub fn record_failure(&self, now: DateTime<Utc>, config: &BreakerConfig) {
        let count = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let was_trial = self.trial_in_flight.swap(false, Ordering::AcqRel);
        if was_trial || count >= config.failure_threshold {
            let until = (now + config.cooldown()).timestamp_millis();
            self.open_until_ms.store(until, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        assert_eq!(breaker.state(now), CircuitState::Closed);
        assert_eq!(breaker.admit(now), Admission::Closed);
        assert!(breaker.open_until().is_none());
    }

    #[test]
    fn opens_at_threshold() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        breaker.record_failure(now, &config());
        breaker.record_failure(now, &config());
        assert_eq!(breaker.state(now), CircuitState::Closed);

        breaker.record_failure(now, &config());
        assert_eq!(breaker.state(now), CircuitState::Open);
        assert_eq!(
            breaker.admit(now + chrono::Duration::seconds(10)),
            Admission::Rejected {
                retry_in: chrono::Duration::seconds(20)
            }
        );
    }

    #[test]
    fn one_trial_after_cooldown() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now, &config());
        }
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(breaker.state(later), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(later), Admission::Trial);
        assert!(matches!(breaker.admit(later), Admission::Rejected { .. }));

        breaker.record_success();
        assert_eq!(breaker.state(later), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now, &config());
        }
        let later = now + chrono::Duration::seconds(31);
        assert_eq!(breaker.admit(later), Admission::Trial);
        breaker.record_failure(later, &config());

        assert_eq!(breaker.state(later), CircuitState::Open);
        assert_eq!(
            breaker.open_until().map(|t| t.timestamp_millis()),
            Some((later + chrono::Duration::seconds(30)).timestamp_millis())
        );
        // A fresh trial is available after the new cooldown.
        assert_eq!(
            breaker.admit(later + chrono::Duration::seconds(30)),
            Admission::Trial
        );
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        breaker.record_failure(now, &config());
        breaker.record_failure(now, &config());
        breaker.record_success();
        breaker.record_failure(now, &config());
        assert_eq!(breaker.state(now), CircuitState::Closed);
    }

    #[test]
    fn abandoned_trial_frees_the_slot() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now, &config());
        }
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(breaker.admit(later), Admission::Trial);
        let guard = breaker.hold_trial();
        assert!(matches!(breaker.admit(later), Admission::Rejected { .. }));

        drop(guard);
        assert_eq!(breaker.admit(later), Admission::Trial);
    }

    #[test]
    fn settled_trial_keeps_reported_state() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now, &config());
        }
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(breaker.admit(later), Admission::Trial);
        let guard = breaker.hold_trial();
        breaker.record_failure(later, &config());
        guard.settle();
        assert_eq!(breaker.state(later), CircuitState::Open);
    }
}
