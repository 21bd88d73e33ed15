//! In-memory authority.
//!
//! Records every call and serves membership from a plain map, with knobs for
//! the failure modes the engine has to survive: scripted errors per call type
//! and reads that lag behind writes. Its state serialises to JSON so a local
//! driver can persist it between runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::Authority;
use crate::error::RemoteError;
use crate::types::{GroupHandle, Identifier};

/// The durable part of the authority: who exists and who belongs where.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorityState {
    /// Member name to identifier.
    #[serde(default)]
    pub users: BTreeMap<String, Identifier>,
    #[serde(default)]
    pub groups: BTreeMap<GroupHandle, BTreeSet<Identifier>>,
}

/// The four remote operations, used to target scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorityOp {
    Lookup,
    List,
    Add,
    Remove,
}

/// One call as the authority saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityCall {
    Lookup(String),
    List(GroupHandle),
    Add(GroupHandle, BTreeSet<Identifier>),
    Remove(GroupHandle, BTreeSet<Identifier>),
}

impl AuthorityCall {
    pub fn is_mutation(&self) -> bool {
        matches!(self, AuthorityCall::Add(..) | AuthorityCall::Remove(..))
    }
}

struct Inner {
    state: AuthorityState,
    calls: Vec<AuthorityCall>,
    failures: HashMap<AuthorityOp, VecDeque<RemoteError>>,
    read_lag: u32,
    stale: HashMap<GroupHandle, (BTreeSet<Identifier>, u32)>,
}

/// A test-double and local simulator of the remote authority.
pub struct InMemoryAuthority {
    inner: Mutex<Inner>,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self::from_state(AuthorityState::default())
    }

    pub fn from_state(state: AuthorityState) -> Self {
        InMemoryAuthority {
            inner: Mutex::new(Inner {
                state,
                calls: Vec::new(),
                failures: HashMap::new(),
                read_lag: 0,
                stale: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a member entity.
    pub fn with_user(self, name: &str, id: &str) -> Self {
        self.lock()
            .state
            .users
            .insert(name.to_string(), Identifier::new(id));
        self
    }

    /// Register a group with initial members.
    pub fn with_group(self, group: &str, members: &[&str]) -> Self {
        self.lock().state.groups.insert(
            GroupHandle::new(group),
            members.iter().map(|m| Identifier::new(*m)).collect(),
        );
        self
    }

    /// After each mutation, the next `reads` listings of that group still
    /// return the pre-mutation membership.
    pub fn with_read_lag(self, reads: u32) -> Self {
        self.lock().read_lag = reads;
        self
    }

    /// Make the next call of `op` fail with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: AuthorityOp, err: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Delete a member entity, dropping it from every group as the real
    /// service does.
    pub fn delete_user(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(id) = inner.state.users.remove(name) {
            for members in inner.state.groups.values_mut() {
                members.remove(&id);
            }
        }
    }

    /// Change membership without going through the engine.
    pub fn add_out_of_band(&self, group: &str, id: &str) {
        self.lock()
            .state
            .groups
            .entry(GroupHandle::new(group))
            .or_default()
            .insert(Identifier::new(id));
    }

    /// The true membership, ignoring read lag.
    pub fn members(&self, group: &str) -> BTreeSet<Identifier> {
        self.lock()
            .state
            .groups
            .get(&GroupHandle::new(group))
            .cloned()
            .unwrap_or_default()
    }

    pub fn state(&self) -> AuthorityState {
        self.lock().state.clone()
    }

    pub fn calls(&self) -> Vec<AuthorityCall> {
        self.lock().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl Default for InMemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn take_failure(&mut self, op: AuthorityOp) -> Option<RemoteError> {
        self.failures.get_mut(&op).and_then(|q| q.pop_front())
    }

    fn group_mut(&mut self, group: &GroupHandle) -> Result<&mut BTreeSet<Identifier>, RemoteError> {
        self.state.groups.get_mut(group).ok_or_else(|| {
            RemoteError::from_code(
                "ResourceNotFound.GroupNotExist",
                format!("group {} does not exist", group),
            )
        })
    }

    fn remember_stale(&mut self, group: &GroupHandle) {
        if self.read_lag == 0 || self.stale.contains_key(group) {
            return;
        }
        if let Some(current) = self.state.groups.get(group) {
            let snapshot = current.clone();
            self.stale.insert(group.clone(), (snapshot, self.read_lag));
        }
    }
}

impl Authority for InMemoryAuthority {
    fn lookup_identifier(&self, name: &str) -> Result<Option<Identifier>, RemoteError> {
        let mut inner = self.lock();
        inner.calls.push(AuthorityCall::Lookup(name.to_string()));
        if let Some(err) = inner.take_failure(AuthorityOp::Lookup) {
            return Err(err);
        }
        Ok(inner.state.users.get(name).cloned())
    }

    fn list_members(&self, group: &GroupHandle) -> Result<BTreeSet<Identifier>, RemoteError> {
        let mut inner = self.lock();
        inner.calls.push(AuthorityCall::List(group.clone()));
        if let Some(err) = inner.take_failure(AuthorityOp::List) {
            return Err(err);
        }
        let lagging = match inner.stale.get_mut(group) {
            Some((snapshot, remaining)) => {
                *remaining -= 1;
                Some((snapshot.clone(), *remaining == 0))
            }
            None => None,
        };
        if let Some((view, exhausted)) = lagging {
            if exhausted {
                inner.stale.remove(group);
            }
            return Ok(view);
        }
        inner.group_mut(group).map(|m| m.clone())
    }

    fn add_members(
        &self,
        group: &GroupHandle,
        members: &BTreeSet<Identifier>,
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(AuthorityCall::Add(group.clone(), members.clone()));
        if let Some(err) = inner.take_failure(AuthorityOp::Add) {
            return Err(err);
        }
        let known: BTreeSet<&Identifier> = inner.state.users.values().collect();
        if let Some(unknown) = members.iter().find(|m| !known.contains(m)) {
            return Err(RemoteError::permanent(
                "InvalidParameter.UserNotExist",
                format!("no member with identifier {}", unknown),
            ));
        }
        inner.group_mut(group)?;
        inner.remember_stale(group);
        inner.group_mut(group)?.extend(members.iter().cloned());
        Ok(())
    }

    fn remove_members(
        &self,
        group: &GroupHandle,
        members: &BTreeSet<Identifier>,
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(AuthorityCall::Remove(group.clone(), members.clone()));
        if let Some(err) = inner.take_failure(AuthorityOp::Remove) {
            return Err(err);
        }
        inner.group_mut(group)?;
        inner.remember_stale(group);
        let current = inner.group_mut(group)?;
        for m in members {
            current.remove(m);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> BTreeSet<Identifier> {
        values.iter().map(|v| Identifier::new(*v)).collect()
    }

    #[test]
    fn lookup_known_and_unknown() {
        let a = InMemoryAuthority::new().with_user("alice", "100");
        assert_eq!(a.lookup_identifier("alice").unwrap(), Some(Identifier::new("100")));
        assert_eq!(a.lookup_identifier("ghost").unwrap(), None);
        assert_eq!(a.calls().len(), 2);
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let g = GroupHandle::new("g");
        let a = InMemoryAuthority::new()
            .with_user("alice", "100")
            .with_group("g", &["100"]);
        a.add_members(&g, &ids(&["100"])).unwrap();
        a.remove_members(&g, &ids(&["100"])).unwrap();
        a.remove_members(&g, &ids(&["100"])).unwrap();
        assert!(a.members("g").is_empty());
        assert_eq!(a.mutation_count(), 3);
    }

    #[test]
    fn add_unknown_identifier_is_permanent_error() {
        let a = InMemoryAuthority::new().with_group("g", &[]);
        let err = a.add_members(&GroupHandle::new("g"), &ids(&["999"])).unwrap_err();
        assert!(!err.is_transient());
        assert!(!err.is_not_found());
    }

    #[test]
    fn unknown_group_is_not_found() {
        let a = InMemoryAuthority::new();
        let err = a.list_members(&GroupHandle::new("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let a = InMemoryAuthority::new().with_group("g", &[]);
        a.fail_next(AuthorityOp::List, RemoteError::transient("first"));
        a.fail_next(AuthorityOp::List, RemoteError::transient("second"));
        let g = GroupHandle::new("g");
        assert_eq!(a.list_members(&g).unwrap_err().message, "first");
        assert_eq!(a.list_members(&g).unwrap_err().message, "second");
        assert!(a.list_members(&g).is_ok());
    }

    #[test]
    fn lagging_reads_return_previous_membership() {
        let g = GroupHandle::new("g");
        let a = InMemoryAuthority::new()
            .with_user("alice", "100")
            .with_group("g", &[])
            .with_read_lag(1);
        a.add_members(&g, &ids(&["100"])).unwrap();
        assert!(a.list_members(&g).unwrap().is_empty());
        assert_eq!(a.list_members(&g).unwrap(), ids(&["100"]));
    }

    #[test]
    fn deleting_user_drops_memberships() {
        let a = InMemoryAuthority::new()
            .with_user("bob", "200")
            .with_group("g", &["200"]);
        a.delete_user("bob");
        assert!(a.members("g").is_empty());
        assert_eq!(a.lookup_identifier("bob").unwrap(), None);
    }

    #[test]
    fn state_round_trips_through_json() {
        let a = InMemoryAuthority::new()
            .with_user("alice", "100")
            .with_group("g", &["100"]);
        let json = serde_json::to_string(&a.state()).unwrap();
        let back: AuthorityState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a.state());
    }
}
