//! Circuit breaker state machine
//!
//! Transitions:
//! - CLOSED → OPEN when the consecutive-failure counter reaches
//!   `failure_threshold`
//! - OPEN → HALF_OPEN after `open_duration` has elapsed, or when a
//!   background health probe succeeds
//! - HALF_OPEN → CLOSED after `half_open_probes` consecutive successes
//! - HALF_OPEN → OPEN on any probe failure
//!
//! A success observed while CLOSED resets the failure counter. All state
//! lives behind one mutex per record; the lock is never held across I/O.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::classify::Outcome;

/// Circuit breaker tunables.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

/// Circuit state of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// State label for summaries and logging.
    pub fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Result of asking the breaker whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal request.
    Admit,
    /// Half-open probe slot granted; the outcome must be reported with
    /// `probe = true` so the slot is released.
    Probe,
    /// Circuit open (or all probe slots taken).
    Reject,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Health record for a single provider.
#[derive(Debug)]
pub struct HealthRecord {
    provider_id: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl HealthRecord {
    pub fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// What `try_admit` would return, without consuming a probe slot or
    /// transitioning state. Used by the router's eligibility filter so that
    /// providers the strategy does not pick never lose probe budget.
    pub fn peek(&self) -> Admission {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Admission::Admit,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_probes {
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
        }
    }

    /// Ask whether a request may be sent to this provider now. May perform
    /// the OPEN → HALF_OPEN transition when the open duration has elapsed.
    pub fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Admission::Admit,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if !elapsed {
                    return Admission::Reject;
                }
                info!(provider_id = %self.provider_id, "circuit half-open after open duration");
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.probes_in_flight = 1;
                Admission::Probe
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_probes {
                    inner.probes_in_flight += 1;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
        }
    }

    /// Record a terminal outcome. `probe` must be true iff `try_admit`
    /// returned `Admission::Probe` for this request.
    pub fn record(&self, outcome: Outcome, probe: bool) {
        let mut inner = self.inner.lock().unwrap();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        match outcome {
            Outcome::Cancelled => {}
            Outcome::Success => match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.half_open_probes {
                        info!(provider_id = %self.provider_id, "circuit closed after successful probes");
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.consecutive_successes = 0;
                        inner.opened_at = None;
                        inner.probes_in_flight = 0;
                    }
                }
                // A success reported while Open (e.g. a request admitted
                // just before the circuit tripped) does not move the state.
                CircuitState::Open => {}
            },
            Outcome::Failure => match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        warn!(
                            provider_id = %self.provider_id,
                            failures = inner.consecutive_failures,
                            "circuit opened"
                        );
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.probes_in_flight = 0;
                    }
                }
                CircuitState::HalfOpen => {
                    warn!(provider_id = %self.provider_id, "probe failed, circuit re-opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.consecutive_failures += 1;
                    inner.consecutive_successes = 0;
                    inner.probes_in_flight = 0;
                }
                CircuitState::Open => {
                    inner.consecutive_failures += 1;
                }
            },
        }
    }

    /// A background health probe succeeded against an OPEN provider: move
    /// to HALF_OPEN so normal probe requests are admitted.
    pub fn probe_succeeded(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open {
            info!(provider_id = %self.provider_id, "health probe succeeded, circuit half-open");
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.probes_in_flight = 0;
        }
    }

    /// Summary for the admin endpoint.
    pub fn summary(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "state": inner.state.label(),
            "consecutive_failures": inner.consecutive_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            open_duration: Duration::from_millis(20),
            half_open_probes: 3,
        }
    }

    #[test]
    fn closed_admits() {
        let record = HealthRecord::new("a", BreakerConfig::default());
        assert_eq!(record.try_admit(), Admission::Admit);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let record = HealthRecord::new("a", BreakerConfig::default());
        for i in 1..=4 {
            record.record(Outcome::Failure, false);
            assert_eq!(record.state(), CircuitState::Closed, "failure {i}");
        }
        record.record(Outcome::Failure, false);
        assert_eq!(record.state(), CircuitState::Open);
        assert_eq!(record.try_admit(), Admission::Reject);
    }

    #[test]
    fn success_resets_failure_counter_while_closed() {
        let record = HealthRecord::new("a", BreakerConfig::default());
        for _ in 0..4 {
            record.record(Outcome::Failure, false);
        }
        record.record(Outcome::Success, false);
        assert_eq!(record.consecutive_failures(), 0);
        for _ in 0..4 {
            record.record(Outcome::Failure, false);
        }
        assert_eq!(record.state(), CircuitState::Closed);
    }

    #[test]
    fn cancelled_touches_nothing() {
        let record = HealthRecord::new("a", BreakerConfig::default());
        for _ in 0..4 {
            record.record(Outcome::Failure, false);
        }
        record.record(Outcome::Cancelled, false);
        assert_eq!(record.consecutive_failures(), 4);
        assert_eq!(record.state(), CircuitState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_duration() {
        let record = HealthRecord::new("a", quick_config());
        for _ in 0..5 {
            record.record(Outcome::Failure, false);
        }
        assert_eq!(record.try_admit(), Admission::Reject);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(record.try_admit(), Admission::Probe);
        assert_eq!(record.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let record = HealthRecord::new("a", quick_config());
        for _ in 0..5 {
            record.record(Outcome::Failure, false);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(record.try_admit(), Admission::Probe);
        assert_eq!(record.try_admit(), Admission::Probe);
        assert_eq!(record.try_admit(), Admission::Probe);
        // Budget of 3 exhausted; further requests treated as though open.
        assert_eq!(record.try_admit(), Admission::Reject);
    }

    #[test]
    fn half_open_closes_after_consecutive_successes() {
        let record = HealthRecord::new("a", quick_config());
        for _ in 0..5 {
            record.record(Outcome::Failure, false);
        }
        std::thread::sleep(Duration::from_millis(25));
        for _ in 0..3 {
            assert_eq!(record.try_admit(), Admission::Probe);
            record.record(Outcome::Success, true);
        }
        assert_eq!(record.state(), CircuitState::Closed);
        assert_eq!(record.consecutive_failures(), 0);
    }

    #[test]
    fn probe_failure_reopens() {
        let record = HealthRecord::new("a", quick_config());
        for _ in 0..5 {
            record.record(Outcome::Failure, false);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(record.try_admit(), Admission::Probe);
        record.record(Outcome::Success, true);
        assert_eq!(record.try_admit(), Admission::Probe);
        record.record(Outcome::Failure, true);
        assert_eq!(record.state(), CircuitState::Open);
        // Freshly re-opened: rejected until the open duration elapses again.
        assert_eq!(record.try_admit(), Admission::Reject);
    }

    #[test]
    fn background_probe_success_moves_open_to_half_open() {
        let record = HealthRecord::new("a", quick_config());
        for _ in 0..5 {
            record.record(Outcome::Failure, false);
        }
        assert_eq!(record.state(), CircuitState::Open);
        record.probe_succeeded();
        assert_eq!(record.state(), CircuitState::HalfOpen);
        assert_eq!(record.try_admit(), Admission::Probe);
    }

    #[test]
    fn failure_counter_never_decreases_on_failure() {
        let record = HealthRecord::new("a", quick_config());
        let mut last = 0;
        for _ in 0..10 {
            record.record(Outcome::Failure, false);
            let now = record.consecutive_failures();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn summary_reports_state_label() {
        let record = HealthRecord::new("a", BreakerConfig::default());
        let summary = record.summary();
        assert_eq!(summary["state"], "closed");
        assert_eq!(summary["consecutive_failures"], 0);
    }
}
