use serde::{Deserialize, Serialize};

use crate::convergence::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// Tunables for a reconciliation session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Budget for read-style calls (identifier lookup, member listing).
    pub read_retry: RetryPolicy,
    /// Budget for write-style calls (add, remove).
    pub write_retry: RetryPolicy,
    /// Fixed wait between a successful mutation and the confirmatory read.
    pub settling_delay_ms: u64,
    /// Bound on the whole session including retries and settling.
    /// `None` leaves the session unbounded.
    pub session_deadline_ms: Option<u64>,
    /// Fail with `PartialApply` instead of reporting a stale snapshot when the
    /// confirmatory read still diverges.
    pub strict_confirmation: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        ReconcileSettings {
            read_retry: RetryPolicy::new(5, BackoffStrategy::Exponential, 500),
            write_retry: RetryPolicy::new(8, BackoffStrategy::Exponential, 1000),
            settling_delay_ms: 10_000,
            session_deadline_ms: Some(600_000),
            strict_confirmation: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let settings = ReconcileSettings {
            read_retry: RetryPolicy::new(2, BackoffStrategy::Fixed, 50),
            write_retry: RetryPolicy::new(4, BackoffStrategy::Linear, 200),
            settling_delay_ms: 0,
            session_deadline_ms: None,
            strict_confirmation: true,
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: ReconcileSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn backoff_strategy_serde() {
        let json = serde_json::to_string(&BackoffStrategy::Exponential).unwrap();
        assert_eq!(json, "\"exponential\"");
    }

    #[test]
    fn write_budget_exceeds_read_budget() {
        let s = ReconcileSettings::default();
        assert!(s.write_retry.max_retries > s.read_retry.max_retries);
        assert_eq!(s.settling_delay_ms, 10_000);
    }
}
