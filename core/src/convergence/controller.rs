//! Convergence controller: the create/read/update/delete lifecycle.
//!
//! Every operation opens its own session (one group, one deadline, one
//! resolver cache), computes a diff, hands it to the executor, and for
//! create/update waits out the settling delay before a single confirmatory
//! read. Re-running any operation after a failure recomputes against fresh
//! remote state and only acts on what is left.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::authority::Authority;
use crate::convergence::clock::Clock;
use crate::convergence::executor::ApplyReport;
use crate::convergence::planner::{self, Diff};
use crate::convergence::resolver::Resolution;
use crate::convergence::session::{LifecycleState, Session, Toolkit};
use crate::error::ReconcileError;
use crate::observer::{BatchDirection, ReconcileEvent, ReconcileObserver};
use crate::types::{
    ActualMembership, DesiredMembership, GroupHandle, Identifier, LocalRecord, MemberRef,
    MemberSpace, MembershipSnapshot, ReconcileSettings,
};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciled {
    pub state: LifecycleState,
    /// Post-apply membership. `None` after a delete.
    pub snapshot: Option<MembershipSnapshot>,
    pub diff: Diff,
    pub report: ApplyReport,
    /// The confirmatory read did not yet show everything that was applied.
    pub stale: bool,
    pub retries: u32,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler<'a> {
    authority: &'a dyn Authority,
    settings: ReconcileSettings,
    clock: &'a dyn Clock,
    observer: &'a dyn ReconcileObserver,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        authority: &'a dyn Authority,
        settings: ReconcileSettings,
        clock: &'a dyn Clock,
        observer: &'a dyn ReconcileObserver,
    ) -> Self {
        Reconciler {
            authority,
            settings,
            clock,
            observer,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    fn open(
        &self,
        group: &GroupHandle,
        operation: &'static str,
        initial: LifecycleState,
    ) -> Session<'_> {
        Session::open(
            group.clone(),
            operation,
            initial,
            self.authority,
            &self.settings,
            self.clock,
            self.observer,
        )
    }

    /// Bring a group that has no local record to `desired`. Only adds;
    /// members already present (ours or not) are left alone.
    pub fn create(&self, desired: &DesiredMembership) -> Result<Reconciled, ReconcileError> {
        let group = desired.group();
        let session = self.open(group, "create", LifecycleState::Absent);
        session.run(|kit| {
            session.advance(LifecycleState::Creating)?;
            let diff = self.creation_diff(kit, desired)?;
            debug!(summary = %diff.summary(), "create plan");

            let report = kit.executor.apply(group, &diff.to_add, &diff.to_remove)?;
            let (snapshot, stale) = self.confirm(&session, kit, desired, &report)?;
            session.advance(LifecycleState::Converged)?;

            self.check_unresolved(group, &diff, &report, &snapshot)?;
            Ok(Reconciled {
                state: session.state(),
                snapshot: Some(snapshot),
                diff,
                report,
                stale,
                retries: session.retries_used(),
            })
        })
    }

    /// Report current membership. With a record, only the members the record
    /// claims are reported; without one, every remote member is reported in
    /// identifier space.
    pub fn read(
        &self,
        group: &GroupHandle,
        record: Option<&LocalRecord>,
    ) -> Result<MembershipSnapshot, ReconcileError> {
        if let Some(record) = record {
            ensure_group(group, &record.group)?;
        }
        let session = self.open(group, "read", LifecycleState::Converged);
        session.run(|kit| {
            let actual = kit.reader.read(group)?;
            match record {
                Some(record) => restrict(kit, record.space, &record.members, actual),
                None => {
                    let members = actual
                        .members
                        .iter()
                        .cloned()
                        .map(MemberRef::Identifier)
                        .collect();
                    Ok(MembershipSnapshot {
                        group: group.clone(),
                        space: MemberSpace::Identifier,
                        members,
                        vacant: actual.is_empty(),
                        actual,
                    })
                }
            }
        })
    }

    /// Move a group from `old` to `new`. Removals are applied before
    /// additions.
    pub fn update(
        &self,
        group: &GroupHandle,
        old: &DesiredMembership,
        new: &DesiredMembership,
    ) -> Result<Reconciled, ReconcileError> {
        ensure_group(group, old.group())?;
        ensure_group(group, new.group())?;
        let session = self.open(group, "update", LifecycleState::Converged);
        session.run(|kit| {
            session.advance(LifecycleState::Updating)?;
            let diff = update_diff(kit, old, new)?;
            debug!(summary = %diff.summary(), "update plan");

            let report = kit.executor.apply(group, &diff.to_add, &diff.to_remove)?;
            let (snapshot, stale) = self.confirm(&session, kit, new, &report)?;
            session.advance(LifecycleState::Converged)?;

            self.check_unresolved(group, &diff, &report, &snapshot)?;
            Ok(Reconciled {
                state: session.state(),
                snapshot: Some(snapshot),
                diff,
                report,
                stale,
                retries: session.retries_used(),
            })
        })
    }

    /// Remove every declared member that is still present. Members already
    /// gone, or that no longer exist at all, count as removed.
    pub fn delete(
        &self,
        group: &GroupHandle,
        desired: &DesiredMembership,
    ) -> Result<Reconciled, ReconcileError> {
        ensure_group(group, desired.group())?;
        let session = self.open(group, "delete", LifecycleState::Converged);
        session.run(|kit| {
            session.advance(LifecycleState::Deleting)?;
            let actual = kit.reader.read(group)?;
            let mut to_remove = BTreeSet::new();
            for member in desired.members() {
                match kit.resolver.resolve_ref(member)? {
                    Resolution::Found(id) if !actual.contains(&id) => {}
                    _ => {
                        to_remove.insert(member.clone());
                    }
                }
            }
            let diff = Diff {
                to_remove,
                ..Diff::default()
            };

            let report = kit.executor.apply(group, &diff.to_add, &diff.to_remove)?;
            session.advance(LifecycleState::Absent)?;
            Ok(Reconciled {
                state: session.state(),
                snapshot: None,
                diff,
                report,
                stale: false,
                retries: session.retries_used(),
            })
        })
    }

    /// The diff `create` (no record) or `update` (with record) would apply,
    /// without mutating anything.
    pub fn plan(
        &self,
        desired: &DesiredMembership,
        record: Option<&LocalRecord>,
    ) -> Result<Diff, ReconcileError> {
        let group = desired.group();
        if let Some(record) = record {
            ensure_group(group, &record.group)?;
        }
        let session = self.open(group, "plan", LifecycleState::Converged);
        session.run(|kit| match record {
            Some(record) => update_diff(kit, &record.to_desired()?, desired),
            None => self.creation_diff(kit, desired),
        })
    }

    fn creation_diff(
        &self,
        kit: &Toolkit<'_>,
        desired: &DesiredMembership,
    ) -> Result<Diff, ReconcileError> {
        let actual = kit.reader.read(desired.group())?;
        let resolved = kit.resolver.resolve_all(desired.members())?;
        let mut diff = planner::diff(desired.members(), &actual.members, &resolved);
        // First creation never removes; foreign members stay.
        diff.to_remove.clear();
        Ok(diff)
    }

    /// Settle (if anything was mutated), re-read once, and compare against
    /// what should now be true.
    fn confirm(
        &self,
        session: &Session<'_>,
        kit: &Toolkit<'_>,
        desired: &DesiredMembership,
        report: &ApplyReport,
    ) -> Result<(MembershipSnapshot, bool), ReconcileError> {
        if !report.is_noop() {
            session.settle()?;
        }
        let actual = kit.reader.read(desired.group())?;

        let mut missing = BTreeSet::new();
        for member in desired.members() {
            if let Resolution::Found(id) = kit.resolver.resolve_ref(member)? {
                if !actual.contains(&id) {
                    missing.insert(id);
                }
            }
        }
        let unexpected: Vec<Identifier> = report
            .removed
            .iter()
            .filter(|id| actual.contains(id))
            .cloned()
            .collect();

        let stale = !missing.is_empty() || !unexpected.is_empty();
        if stale {
            self.observer.on_event(&ReconcileEvent::Diverged {
                missing: missing.len(),
                unexpected: unexpected.len(),
            });
            if self.settings.strict_confirmation {
                return Err(ReconcileError::PartialApply {
                    membership: actual,
                    missing: missing.into_iter().collect(),
                    unexpected,
                });
            }
        }

        let snapshot = restrict(kit, desired.space(), desired.members(), actual)?;
        Ok((snapshot, stale))
    }

    /// Raise every unresolved addition at once, after the rest was applied.
    fn check_unresolved(
        &self,
        group: &GroupHandle,
        diff: &Diff,
        report: &ApplyReport,
        snapshot: &MembershipSnapshot,
    ) -> Result<(), ReconcileError> {
        for member in &diff.unresolved {
            self.observer.on_event(&ReconcileEvent::MemberUnresolved {
                member: member.clone(),
                direction: BatchDirection::Add,
            });
        }
        let names: BTreeSet<String> = diff
            .unresolved
            .iter()
            .map(|m| m.as_str().to_string())
            .chain(report.unresolved_names())
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        Err(ReconcileError::Unresolved {
            group: group.clone(),
            names: names.into_iter().collect(),
            membership: Box::new(snapshot.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_group(expected: &GroupHandle, found: &GroupHandle) -> Result<(), ReconcileError> {
    if expected != found {
        return Err(ReconcileError::Configuration(format!(
            "membership for group {} cannot be applied to group {}",
            found, expected
        )));
    }
    Ok(())
}

/// Keep only the claimed members that are actually present.
fn restrict(
    kit: &Toolkit<'_>,
    space: MemberSpace,
    claimed: &BTreeSet<MemberRef>,
    actual: ActualMembership,
) -> Result<MembershipSnapshot, ReconcileError> {
    let mut members = BTreeSet::new();
    for member in claimed {
        if let Resolution::Found(id) = kit.resolver.resolve_ref(member)? {
            if actual.contains(&id) {
                members.insert(member.clone());
            }
        }
    }
    Ok(MembershipSnapshot {
        group: actual.group.clone(),
        space,
        members,
        vacant: actual.is_empty(),
        actual,
    })
}

/// Declaration diff between two desired sets, taken against fresh remote
/// state: the old declaration only counts for members still present, and new
/// members already present are not added again. When the spaces differ both
/// sides are projected into identifier space first; names that do not
/// resolve stay names so the executor can report or drop them.
fn update_diff(
    kit: &Toolkit<'_>,
    old: &DesiredMembership,
    new: &DesiredMembership,
) -> Result<Diff, ReconcileError> {
    let actual = kit.reader.read(old.group())?;
    let present = restrict(kit, old.space(), old.members(), actual.clone())?.members;
    let mut diff = if old.space() == new.space() {
        planner::diff_declarations(&present, new.members())
    } else {
        let from = project(kit, &present)?;
        let to = project(kit, new.members())?;
        planner::diff_declarations(&from, &to)
    };

    let mut to_add = BTreeSet::new();
    for member in diff.to_add {
        match kit.resolver.resolve_ref(&member)? {
            Resolution::Found(id) if actual.contains(&id) => {}
            _ => {
                to_add.insert(member);
            }
        }
    }
    diff.to_add = to_add;
    Ok(diff)
}

fn project(
    kit: &Toolkit<'_>,
    members: &BTreeSet<MemberRef>,
) -> Result<BTreeSet<MemberRef>, ReconcileError> {
    let mut projected = BTreeSet::new();
    for member in members {
        match kit.resolver.resolve_ref(member)? {
            Resolution::Found(id) => projected.insert(MemberRef::Identifier(id)),
            Resolution::NotFound => projected.insert(member.clone()),
        };
    }
    Ok(projected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
