//! One reconciliation session: a single operation against a single group.
//!
//! A session owns the retry loop and deadline for its operation, tracks the
//! lifecycle state machine, and hands the resolver/reader/executor trio to the
//! controller for the duration of one closure. Nothing outlives the session;
//! in particular the resolver cache is dropped with it.

use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::authority::Authority;
use crate::convergence::clock::Clock;
use crate::convergence::executor::MutationExecutor;
use crate::convergence::reader::MembershipReader;
use crate::convergence::resolver::IdentifierResolver;
use crate::convergence::retry::{Deadline, Retrier};
use crate::error::ReconcileError;
use crate::observer::{ReconcileEvent, ReconcileObserver};
use crate::types::{GroupHandle, ReconcileSettings};

// ---------------------------------------------------------------------------
// LifecycleState
// ---------------------------------------------------------------------------

/// Where a group's membership is in its lifecycle. `Converged` is the only
/// stable state of a managed group; every other state except `Absent` exists
/// only while an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Absent,
    Creating,
    Converged,
    Updating,
    Deleting,
}

impl LifecycleState {
    pub fn can_transition(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Converged)
                | (Converged, Updating)
                | (Updating, Converged)
                | (Converged, Deleting)
                | (Deleting, Absent)
        )
    }

    pub fn is_rest_state(self) -> bool {
        matches!(self, LifecycleState::Converged | LifecycleState::Absent)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Components available to an operation while its session is open.
pub struct Toolkit<'t> {
    pub resolver: &'t IdentifierResolver<'t>,
    pub reader: MembershipReader<'t>,
    pub executor: MutationExecutor<'t>,
}

pub struct Session<'a> {
    id: String,
    group: GroupHandle,
    operation: &'static str,
    authority: &'a dyn Authority,
    observer: &'a dyn ReconcileObserver,
    retrier: Retrier<'a>,
    settling_delay_ms: u64,
    state: Cell<LifecycleState>,
}

impl<'a> Session<'a> {
    pub fn open(
        group: GroupHandle,
        operation: &'static str,
        initial: LifecycleState,
        authority: &'a dyn Authority,
        settings: &ReconcileSettings,
        clock: &'a dyn Clock,
        observer: &'a dyn ReconcileObserver,
    ) -> Self {
        let retrier = Retrier::new(
            settings.read_retry.clone(),
            settings.write_retry.clone(),
            Deadline::start(clock, settings.session_deadline_ms),
            clock,
            observer,
        );
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            group,
            operation,
            authority,
            observer,
            retrier,
            settling_delay_ms: settings.settling_delay_ms,
            state: Cell::new(initial),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn retries_used(&self) -> u32 {
        self.retrier.retries_used()
    }

    /// Move the state machine forward, rejecting illegal transitions.
    pub fn advance(&self, next: LifecycleState) -> Result<(), ReconcileError> {
        let current = self.state.get();
        if !current.can_transition(next) {
            return Err(ReconcileError::Lifecycle(format!(
                "group {}: {:?} -> {:?}",
                self.group, current, next
            )));
        }
        self.state.set(next);
        Ok(())
    }

    /// Wait out the settling delay before a confirmatory read.
    pub fn settle(&self) -> Result<(), ReconcileError> {
        self.observer.on_event(&ReconcileEvent::Settling {
            delay_ms: self.settling_delay_ms,
        });
        self.retrier.wait("settle", self.settling_delay_ms)
    }

    /// Run `op` with the session's components inside a tracing span.
    pub fn run<T>(
        &self,
        op: impl FnOnce(&Toolkit<'_>) -> Result<T, ReconcileError>,
    ) -> Result<T, ReconcileError> {
        let span = info_span!(
            "reconcile",
            session = %self.id,
            group = %self.group,
            operation = self.operation
        );
        let _entered = span.enter();

        self.observer.on_event(&ReconcileEvent::SessionStarted {
            session: self.id.clone(),
            group: self.group.clone(),
            operation: self.operation.to_string(),
        });

        let resolver = IdentifierResolver::new(self.authority, &self.retrier);
        let toolkit = Toolkit {
            resolver: &resolver,
            reader: MembershipReader::new(self.authority, &self.retrier),
            executor: MutationExecutor::new(self.authority, &self.retrier, &resolver, self.observer),
        };
        let result = op(&toolkit);

        let elapsed_ms = self.retrier.elapsed_ms();
        match &result {
            Ok(_) => info!(elapsed_ms, state = ?self.state(), "operation complete"),
            Err(e) => warn!(elapsed_ms, state = ?self.state(), error = %e, "operation failed"),
        }
        self.observer.on_event(&ReconcileEvent::SessionFinished {
            session: self.id.clone(),
            elapsed_ms,
            retries: self.retries_used(),
            ok: result.is_ok(),
        });
        result
    }
}
