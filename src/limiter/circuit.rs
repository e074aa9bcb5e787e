//! Per-source circuit breaker driven by consecutive failures.
//!
//! - First failure streak reaching the threshold opens the circuit.
//! - While open, calls are rejected until the cooldown since the last failure
//!   has passed; then exactly one trial call is let through (half-open).
//! - The trial's outcome closes or re-opens the circuit.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The circuit just moved to half-open; this caller carries the trial.
    Trial,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            trial_in_flight: false,
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a call may proceed at `now`. May flip open -> half-open.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
            CircuitState::Open => {
                let cooled = self
                    .last_failure_at
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub fn on_success(&mut self) -> Option<Transition> {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.trial_in_flight = false;
                Some(Transition::Closed)
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            // A straggler that started before the circuit opened; only a trial may close it.
            CircuitState::Open => None,
        }
    }

    pub fn on_failure(&mut self, now: Instant, threshold: u32) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                Some(Transition::Opened)
            }
            CircuitState::Closed if self.consecutive_failures >= threshold.max(1) => {
                self.state = CircuitState::Open;
                Some(Transition::Opened)
            }
            _ => None,
        }
    }

    /// The trial caller gave up before reaching the provider (queue timeout,
    /// cancellation). Lets the next caller carry the trial instead.
    pub fn abort_trial(&mut self) {
        self.trial_in_flight = false;
    }
}
