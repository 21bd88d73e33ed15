//! Session events and the observer they are delivered to.
//!
//! The engine never reaches for global hooks. Callers hand a
//! `ReconcileObserver` to the controller; `TracingObserver` forwards events to
//! `tracing`, `RecordingObserver` keeps them for assertions.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{GroupHandle, MemberRef};

/// Direction of a mutation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchDirection {
    Add,
    Remove,
}

/// Something noteworthy that happened during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReconcileEvent {
    SessionStarted {
        session: String,
        group: GroupHandle,
        operation: String,
    },
    Retrying {
        op: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    MemberUnresolved {
        member: MemberRef,
        direction: BatchDirection,
    },
    BatchApplied {
        direction: BatchDirection,
        count: usize,
    },
    BatchSkipped {
        direction: BatchDirection,
    },
    Settling {
        delay_ms: u64,
    },
    Diverged {
        missing: usize,
        unexpected: usize,
    },
    SessionFinished {
        session: String,
        elapsed_ms: u64,
        retries: u32,
        ok: bool,
    },
}

pub trait ReconcileObserver: Send + Sync {
    fn on_event(&self, event: &ReconcileEvent);
}

/// Discards everything.
pub struct NoopObserver;

impl ReconcileObserver for NoopObserver {
    fn on_event(&self, _event: &ReconcileEvent) {}
}

/// Emits each event as a `tracing` event in the current span.
pub struct TracingObserver;

impl ReconcileObserver for TracingObserver {
    fn on_event(&self, event: &ReconcileEvent) {
        match event {
            ReconcileEvent::SessionStarted { session, group, operation } => {
                info!(%session, %group, %operation, "session started");
            }
            ReconcileEvent::Retrying { op, attempt, delay_ms, error } => {
                warn!(%op, attempt, delay_ms, %error, "retrying remote call");
            }
            ReconcileEvent::MemberUnresolved { member, direction } => match direction {
                BatchDirection::Add => warn!(%member, "member cannot be resolved, not added"),
                BatchDirection::Remove => {
                    debug!(%member, "member no longer exists, removal already satisfied")
                }
            },
            ReconcileEvent::BatchApplied { direction, count } => {
                info!(?direction, count, "batch applied");
            }
            ReconcileEvent::BatchSkipped { direction } => {
                debug!(?direction, "batch empty, remote call skipped");
            }
            ReconcileEvent::Settling { delay_ms } => {
                debug!(delay_ms, "waiting for remote to settle");
            }
            ReconcileEvent::Diverged { missing, unexpected } => {
                warn!(missing, unexpected, "confirmatory read differs from applied state");
            }
            ReconcileEvent::SessionFinished { session, elapsed_ms, retries, ok } => {
                info!(%session, elapsed_ms, retries, ok, "session finished");
            }
        }
    }
}

/// Keeps every event in order.
pub struct RecordingObserver {
    events: Mutex<Vec<ReconcileEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        RecordingObserver {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<ReconcileEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ReconcileEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileObserver for RecordingObserver {
    fn on_event(&self, event: &ReconcileEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
