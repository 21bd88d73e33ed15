//! Mutation executor: applies one removal batch and one addition batch
//! against the authority under the write retry budget.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authority::Authority;
use crate::convergence::resolver::{IdentifierResolver, Resolution};
use crate::convergence::retry::{CallKind, Retrier};
use crate::error::ReconcileError;
use crate::observer::{BatchDirection, ReconcileEvent, ReconcileObserver};
use crate::types::{GroupHandle, Identifier, MemberRef};

/// What an `apply` call actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub added: BTreeSet<Identifier>,
    pub removed: BTreeSet<Identifier>,
    /// Removals skipped because the member no longer exists.
    pub dropped_removals: BTreeSet<MemberRef>,
    /// Additions skipped because the member cannot be resolved.
    pub unresolved_additions: BTreeSet<MemberRef>,
}

impl ApplyReport {
    /// Whether no remote mutation was issued.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn unresolved_names(&self) -> Vec<String> {
        self.unresolved_additions
            .iter()
            .map(|m| m.as_str().to_string())
            .collect()
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.dropped_removals.extend(other.dropped_removals);
        self.unresolved_additions.extend(other.unresolved_additions);
    }
}

pub struct MutationExecutor<'s> {
    authority: &'s dyn Authority,
    retrier: &'s Retrier<'s>,
    resolver: &'s IdentifierResolver<'s>,
    observer: &'s dyn ReconcileObserver,
}

impl<'s> MutationExecutor<'s> {
    pub fn new(
        authority: &'s dyn Authority,
        retrier: &'s Retrier<'s>,
        resolver: &'s IdentifierResolver<'s>,
        observer: &'s dyn ReconcileObserver,
    ) -> Self {
        MutationExecutor {
            authority,
            retrier,
            resolver,
            observer,
        }
    }

    /// Resolve both batches, then issue at most one remove call followed by
    /// at most one add call. Unresolvable removals are dropped; unresolvable
    /// additions are reported in `ApplyReport::unresolved_additions` while the
    /// rest of the batch still goes through.
    pub fn apply(
        &self,
        group: &GroupHandle,
        to_add: &BTreeSet<MemberRef>,
        to_remove: &BTreeSet<MemberRef>,
    ) -> Result<ApplyReport, ReconcileError> {
        let mut report = ApplyReport::default();

        let mut remove_ids = BTreeSet::new();
        for member in to_remove {
            match self.resolver.resolve_ref(member)? {
                Resolution::Found(id) => {
                    remove_ids.insert(id);
                }
                Resolution::NotFound => {
                    self.observer.on_event(&ReconcileEvent::MemberUnresolved {
                        member: member.clone(),
                        direction: BatchDirection::Remove,
                    });
                    report.dropped_removals.insert(member.clone());
                }
            }
        }

        let mut add_ids = BTreeSet::new();
        for member in to_add {
            match self.resolver.resolve_ref(member)? {
                Resolution::Found(id) => {
                    add_ids.insert(id);
                }
                Resolution::NotFound => {
                    self.observer.on_event(&ReconcileEvent::MemberUnresolved {
                        member: member.clone(),
                        direction: BatchDirection::Add,
                    });
                    report.unresolved_additions.insert(member.clone());
                }
            }
        }

        if self.send(group, BatchDirection::Remove, &remove_ids)? {
            report.removed = remove_ids;
        }
        if self.send(group, BatchDirection::Add, &add_ids)? {
            report.added = add_ids;
        }
        Ok(report)
    }

    /// Issue one batch. Returns `false` when the batch was empty and skipped.
    fn send(
        &self,
        group: &GroupHandle,
        direction: BatchDirection,
        ids: &BTreeSet<Identifier>,
    ) -> Result<bool, ReconcileError> {
        if ids.is_empty() {
            self.observer
                .on_event(&ReconcileEvent::BatchSkipped { direction });
            return Ok(false);
        }
        match direction {
            BatchDirection::Add => self.retrier.call(CallKind::Write, "add_members", || {
                self.authority.add_members(group, ids)
            })?,
            BatchDirection::Remove => {
                self.retrier.call(CallKind::Write, "remove_members", || {
                    self.authority.remove_members(group, ids)
                })?
            }
        }
        info!(%group, ?direction, count = ids.len(), "membership batch sent");
        self.observer.on_event(&ReconcileEvent::BatchApplied {
            direction,
            count: ids.len(),
        });
        Ok(true)
    }
}
