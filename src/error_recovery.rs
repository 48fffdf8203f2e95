//! Automatic error recovery strategies.
//!
//! The run engine never skips a point. Every fault raised while moving to a point
//! or acquiring it is fed into a [`RetryTracker`], which decides how the same point
//! is retried:
//!
//! ```text
//!                   contention                 3rd consecutive timeout
//!   Attempting ─────────────────▶ RecoveringContention      RecoveringTimeout
//!       ▲  │ timeout (< threshold)        │                        │
//!       │  └──────────▶ Attempting        │ reset + reconfigure    │ reconfigure
//!       │                                 ▼                        ▼
//!       └──────────────────────────── Attempting ◀─────────────────┘
//!       │ other fault
//!       ▼
//!   BackingOff ── sleep(backoff) ──▶ Attempting
//! ```
//!
//! The tracker holds no timers; the caller performs the recovery action or sleep
//! for the returned state, which keeps the policy testable without delays.

use crate::error::FaultKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defines how faults are retried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive timeouts tolerated before the instrument is reconfigured.
    pub timeout_threshold: u32,
    /// The delay before retrying after a generic fault.
    #[serde(with = "millis", rename = "backoff_ms")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_threshold: 3,
            backoff_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Reject policies the tracker cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_threshold == 0 {
            return Err("timeout_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// What the run engine does next for the current point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Run (or rerun) the move/trigger/read cycle.
    Attempting,
    /// Reset the bus interface, reapply the task, then retry.
    RecoveringContention,
    /// Reapply the task, then retry.
    RecoveringTimeout,
    /// Wait for the back-off delay, then retry.
    BackingOff,
}

/// Per-run fault bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    state: RetryState,
    consecutive_timeouts: u32,
    point_retries: u32,
    total_retries: u64,
}

impl RetryTracker {
    /// Start in `Attempting` with no faults recorded.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting,
            consecutive_timeouts: 0,
            point_retries: 0,
            total_retries: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries spent on the current point so far.
    pub fn point_retries(&self) -> u32 {
        self.point_retries
    }

    /// Retries spent over the whole run.
    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }

    /// Timeouts seen since the last success or other fault.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Record a fault and return the next state.
    pub fn on_fault(&mut self, kind: FaultKind) -> RetryState {
        self.point_retries += 1;
        self.total_retries += 1;
        self.state = match kind {
            FaultKind::Contention => {
                self.consecutive_timeouts = 0;
                RetryState::RecoveringContention
            }
            FaultKind::Timeout => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= self.policy.timeout_threshold {
                    self.consecutive_timeouts = 0;
                    RetryState::RecoveringTimeout
                } else {
                    RetryState::Attempting
                }
            }
            FaultKind::Other => {
                self.consecutive_timeouts = 0;
                RetryState::BackingOff
            }
        };
        self.state
    }

    /// The recovery action or back-off for the current state finished.
    pub fn on_recovered(&mut self) -> RetryState {
        self.state = RetryState::Attempting;
        self.state
    }

    /// The point was acquired. Returns the retries it took and resets per-point
    /// counters.
    pub fn on_success(&mut self) -> u32 {
        let retries = self.point_retries;
        self.point_retries = 0;
        self.consecutive_timeouts = 0;
        self.state = RetryState::Attempting;
        retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_recovers_immediately() {
        let mut tracker = RetryTracker::new(RetryPolicy::default());
        assert_eq!(
            tracker.on_fault(FaultKind::Contention),
            RetryState::RecoveringContention
        );
        assert_eq!(tracker.on_recovered(), RetryState::Attempting);
        assert_eq!(tracker.on_success(), 1);
        assert_eq!(tracker.point_retries(), 0);
        assert_eq!(tracker.total_retries(), 1);
    }

    #[test]
    fn test_third_consecutive_timeout_reconfigures() {
        let mut tracker = RetryTracker::new(RetryPolicy::default());
        assert_eq!(tracker.on_fault(FaultKind::Timeout), RetryState::Attempting);
        assert_eq!(tracker.on_fault(FaultKind::Timeout), RetryState::Attempting);
        assert_eq!(
            tracker.on_fault(FaultKind::Timeout),
            RetryState::RecoveringTimeout
        );
        assert_eq!(tracker.consecutive_timeouts(), 0);
        tracker.on_recovered();

        // counting restarts after the recovery
        assert_eq!(tracker.on_fault(FaultKind::Timeout), RetryState::Attempting);
    }

    #[test]
    fn test_other_fault_breaks_timeout_streak() {
        let mut tracker = RetryTracker::new(RetryPolicy::default());
        tracker.on_fault(FaultKind::Timeout);
        tracker.on_fault(FaultKind::Timeout);
        assert_eq!(tracker.on_fault(FaultKind::Other), RetryState::BackingOff);
        tracker.on_recovered();
        assert_eq!(tracker.on_fault(FaultKind::Timeout), RetryState::Attempting);
        assert_eq!(tracker.consecutive_timeouts(), 1);
    }

    #[test]
    fn test_success_resets_timeout_streak() {
        let mut tracker = RetryTracker::new(RetryPolicy::default());
        tracker.on_fault(FaultKind::Timeout);
        tracker.on_fault(FaultKind::Timeout);
        assert_eq!(tracker.on_success(), 2);
        assert_eq!(tracker.on_fault(FaultKind::Timeout), RetryState::Attempting);
    }

    #[test]
    fn test_generic_faults_never_escalate() {
        let mut tracker = RetryTracker::new(RetryPolicy::default());
        for _ in 0..1000 {
            assert_eq!(tracker.on_fault(FaultKind::Other), RetryState::BackingOff);
            tracker.on_recovered();
        }
        assert_eq!(tracker.point_retries(), 1000);
    }

    #[test]
    fn test_zero_timeout_threshold_rejected() {
        assert!(RetryPolicy::default().validate().is_ok());
        let policy = RetryPolicy {
            timeout_threshold: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().unwrap_err().contains("timeout_threshold"));
    }

    #[test]
    fn test_policy_deserializes_backoff_in_millis() {
        let policy: RetryPolicy =
            toml::from_str("timeout_threshold = 5\nbackoff_ms = 250\n").unwrap();
        assert_eq!(policy.timeout_threshold, 5);
        assert_eq!(policy.backoff_delay, Duration::from_millis(250));
    }
}
