//! Per-source circuit breaker
//!
//! Explicit three-state machine (closed / open / half-open) with an
//! injectable clock so timeout-driven transitions are testable without
//! real sleeps.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Clock abstraction; production uses `SystemClock`, tests drive a manual
/// clock forward explicitly
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures accumulate, successes decay the counter
    Closed,
    /// Tripped; calls are short-circuited until the cooldown elapses
    Open,
    /// Cooldown elapsed; limited trial calls decide reopen vs close
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before trial calls
    pub cooldown: Duration,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Consecutive trial successes required to close
    pub half_open_successes_to_close: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::seconds(60),
            half_open_max_calls: 3,
            half_open_successes_to_close: 2,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_calls: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_calls: 0,
            half_open_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the next trial call becomes possible, if the circuit is open
    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Open => self.opened_at.map(|t| t + self.config.cooldown),
            _ => None,
        }
    }

    /// Whether a call may proceed now. Transitions open -> half-open when
    /// the cooldown has elapsed; while half-open, admits only the
    /// configured number of trial calls.
    pub fn allow_request(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .map(|t| now - t >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    self.transition_half_open();
                    self.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, _now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                // Failure counter decays on success rather than resetting,
                // so intermittent flapping still trips eventually
                self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_successes_to_close {
                    self.transition_closed();
                }
            }
            CircuitState::Open => {
                // A success while open means the caller bypassed
                // allow_request; treat it as a trial success
                self.transition_half_open();
                self.half_open_successes = 1;
            }
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.transition_open(now);
                }
            }
            CircuitState::HalfOpen => {
                // Any trial failure reopens with a fresh cooldown
                self.consecutive_failures += 1;
                self.transition_open(now);
            }
            CircuitState::Open => {
                // Keep counting so alert severity can still escalate
                self.consecutive_failures += 1;
                self.opened_at = Some(now);
            }
        }
    }

    fn transition_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    fn transition_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    fn transition_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    /// Reset the consecutive failure counter fully (used when the monitor
    /// observes sustained recovery)
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }
}
