//! Retry policies, the session deadline, and the bounded retry loop every
//! remote call runs through.
//!
//! Read-style calls (lookup, list) and write-style calls (add, remove) run
//! under separate `RetryPolicy` budgets. Only transient errors are retried;
//! not-found and permanent errors leave the loop on the first attempt. All
//! waiting, including the settling delay, is charged against one `Deadline`.

use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::convergence::clock::Clock;
use crate::error::{ReconcileError, RemoteError};
use crate::observer::{ReconcileEvent, ReconcileObserver};
use crate::types::config::BackoffStrategy;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// A retry policy that controls how many times a call may be retried and
/// how long to wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_retries,
            strategy,
            base_delay_ms,
        }
    }

    /// Whether the given retry number (0-indexed) is within the budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Compute the delay in milliseconds before the given retry.
    ///
    /// Attempt 0 is the first retry (after the initial failure).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, exponential backoff, 1000ms base delay.
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
        }
    }
}

/// Which budget a remote call is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Read,
    Write,
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Session-wide time bound.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started_ms: u64,
    budget_ms: Option<u64>,
}

impl Deadline {
    pub fn start(clock: &dyn Clock, budget_ms: Option<u64>) -> Self {
        Deadline {
            started_ms: clock.now_ms(),
            budget_ms,
        }
    }

    pub fn elapsed_ms(&self, clock: &dyn Clock) -> u64 {
        clock.now_ms().saturating_sub(self.started_ms)
    }

    /// Fail if the deadline has already passed.
    pub fn check(&self, clock: &dyn Clock, op: &str) -> Result<(), ReconcileError> {
        self.check_with_wait(clock, op, 0)
    }

    /// Fail if waiting `wait_ms` more would overrun the deadline.
    pub fn check_with_wait(
        &self,
        clock: &dyn Clock,
        op: &str,
        wait_ms: u64,
    ) -> Result<(), ReconcileError> {
        let Some(budget_ms) = self.budget_ms else {
            return Ok(());
        };
        let elapsed_ms = self.elapsed_ms(clock);
        if elapsed_ms.saturating_add(wait_ms) > budget_ms {
            return Err(ReconcileError::Timeout {
                op: op.to_string(),
                elapsed_ms,
                budget_ms,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retrier
// ---------------------------------------------------------------------------

/// Runs remote calls for one session under the read/write budgets and the
/// session deadline.
pub struct Retrier<'a> {
    read: RetryPolicy,
    write: RetryPolicy,
    deadline: Deadline,
    clock: &'a dyn Clock,
    observer: &'a dyn ReconcileObserver,
    retries_used: Cell<u32>,
}

impl<'a> Retrier<'a> {
    pub fn new(
        read: RetryPolicy,
        write: RetryPolicy,
        deadline: Deadline,
        clock: &'a dyn Clock,
        observer: &'a dyn ReconcileObserver,
    ) -> Self {
        Retrier {
            read,
            write,
            deadline,
            clock,
            observer,
            retries_used: Cell::new(0),
        }
    }

    fn policy(&self, kind: CallKind) -> &RetryPolicy {
        match kind {
            CallKind::Read => &self.read,
            CallKind::Write => &self.write,
        }
    }

    /// Call `f` until it succeeds, fails non-transiently, exhausts the budget
    /// for `kind`, or the deadline would be overrun by the next backoff.
    pub fn call<T>(
        &self,
        kind: CallKind,
        op: &str,
        mut f: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, ReconcileError> {
        let policy = self.policy(kind).clone();
        let mut attempt: u32 = 0;
        loop {
            self.deadline.check(self.clock, op)?;
            let err = match f() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_transient() {
                debug!(op, code = %err.code, "remote call failed permanently");
                return Err(ReconcileError::Remote {
                    op: op.to_string(),
                    source: err,
                });
            }
            if !policy.should_retry(attempt) {
                warn!(op, attempts = attempt + 1, error = %err, "retry budget exhausted");
                return Err(ReconcileError::Transient {
                    op: op.to_string(),
                    attempts: attempt + 1,
                    source: err,
                });
            }
            let delay_ms = policy.delay_ms(attempt);
            self.deadline.check_with_wait(self.clock, op, delay_ms)?;
            self.observer.on_event(&ReconcileEvent::Retrying {
                op: op.to_string(),
                attempt: attempt + 1,
                delay_ms,
                error: err.to_string(),
            });
            self.clock.sleep_ms(delay_ms);
            self.retries_used.set(self.retries_used.get() + 1);
            attempt += 1;
        }
    }

    /// Block for `ms`, charged to the deadline.
    pub fn wait(&self, op: &str, ms: u64) -> Result<(), ReconcileError> {
        self.deadline.check_with_wait(self.clock, op, ms)?;
        self.clock.sleep_ms(ms);
        Ok(())
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used.get()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.deadline.elapsed_ms(self.clock)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::clock::ManualClock;
    use crate::observer::{NoopObserver, RecordingObserver};

    fn retrier<'a>(
        clock: &'a ManualClock,
        observer: &'a dyn ReconcileObserver,
        budget_ms: Option<u64>,
    ) -> Retrier<'a> {
        Retrier::new(
            RetryPolicy::new(2, BackoffStrategy::Fixed, 100),
            RetryPolicy::new(4, BackoffStrategy::Exponential, 100),
            Deadline::start(clock, budget_ms),
            clock,
            observer,
        )
    }

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay_ms, 1000);
        assert!(matches!(p.strategy, BackoffStrategy::Exponential));
    }

    #[test]
    fn should_retry_within_budget() {
        let p = RetryPolicy::new(3, BackoffStrategy::Fixed, 100);
        assert!(p.should_retry(0));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
    }

    #[test]
    fn backoff_delays() {
        let fixed = RetryPolicy::new(3, BackoffStrategy::Fixed, 500);
        assert_eq!(fixed.delay_ms(5), 500);
        let linear = RetryPolicy::new(5, BackoffStrategy::Linear, 1000);
        assert_eq!(linear.delay_ms(2), 3000);
        let exp = RetryPolicy::new(5, BackoffStrategy::Exponential, 1000);
        assert_eq!(exp.delay_ms(0), 1000);
        assert_eq!(exp.delay_ms(3), 8000);
        assert_eq!(exp.delay_ms(200), u64::MAX);
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let clock = ManualClock::new();
        let observer = RecordingObserver::new();
        let r = retrier(&clock, &observer, None);
        let mut calls = 0;
        let out = r.call(CallKind::Read, "list", || {
            calls += 1;
            if calls < 3 {
                Err(RemoteError::transient("busy"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(r.retries_used(), 2);
        assert_eq!(clock.sleeps(), vec![100, 100]);
        assert_eq!(observer.count(|e| matches!(e, ReconcileEvent::Retrying { .. })), 2);
    }

    #[test]
    fn read_budget_is_shorter_than_write_budget() {
        let clock = ManualClock::new();
        let r = retrier(&clock, &NoopObserver, None);
        let mut reads = 0;
        let err = r
            .call::<()>(CallKind::Read, "lookup", || {
                reads += 1;
                Err(RemoteError::transient("busy"))
            })
            .unwrap_err();
        assert_eq!(reads, 3);
        assert!(matches!(err, ReconcileError::Transient { attempts: 3, .. }));

        let mut writes = 0;
        let _ = r.call::<()>(CallKind::Write, "add", || {
            writes += 1;
            Err(RemoteError::transient("busy"))
        });
        assert_eq!(writes, 5);
    }

    #[test]
    fn permanent_errors_abort_immediately() {
        let clock = ManualClock::new();
        let r = retrier(&clock, &NoopObserver, None);
        let mut calls = 0;
        let err = r
            .call::<()>(CallKind::Write, "add", || {
                calls += 1;
                Err(RemoteError::not_found("no such user"))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        match err {
            ReconcileError::Remote { source, .. } => assert!(source.is_not_found()),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn deadline_stops_backoff() {
        let clock = ManualClock::new();
        let r = retrier(&clock, &NoopObserver, Some(250));
        let err = r
            .call::<()>(CallKind::Write, "add", || Err(RemoteError::transient("busy")))
            .unwrap_err();
        // 100 + 200 would overrun 250 on the second backoff.
        assert!(matches!(err, ReconcileError::Timeout { budget_ms: 250, .. }));
        assert_eq!(clock.sleeps(), vec![100]);
    }

    #[test]
    fn wait_is_charged_to_deadline() {
        let clock = ManualClock::new();
        let r = retrier(&clock, &NoopObserver, Some(1000));
        r.wait("settle", 600).unwrap();
        assert!(r.wait("settle", 600).is_err());
        assert_eq!(r.elapsed_ms(), 600);
    }
}
