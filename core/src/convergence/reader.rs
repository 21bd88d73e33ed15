//! Membership reader: fetches authoritative membership, never cached.

use tracing::debug;

use crate::authority::Authority;
use crate::convergence::retry::{CallKind, Retrier};
use crate::error::ReconcileError;
use crate::types::{ActualMembership, GroupHandle};

pub struct MembershipReader<'s> {
    authority: &'s dyn Authority,
    retrier: &'s Retrier<'s>,
}

impl<'s> MembershipReader<'s> {
    pub fn new(authority: &'s dyn Authority, retrier: &'s Retrier<'s>) -> Self {
        MembershipReader { authority, retrier }
    }

    /// Current membership of `group`. An empty set is a valid answer.
    pub fn read(&self, group: &GroupHandle) -> Result<ActualMembership, ReconcileError> {
        let members = self
            .retrier
            .call(CallKind::Read, "list_members", || self.authority.list_members(group))?;
        debug!(%group, count = members.len(), "read membership");
        Ok(ActualMembership {
            group: group.clone(),
            members,
        })
    }
}
