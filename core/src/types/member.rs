//! Membership data model: group handles, member references and the
//! desired/actual/recorded membership values that flow through a session.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

// ---------------------------------------------------------------------------
// GroupHandle / Identifier
// ---------------------------------------------------------------------------

/// Opaque reference to a group held by the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupHandle(String);

impl GroupHandle {
    pub fn new(id: impl Into<String>) -> Self {
        GroupHandle(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authority-assigned member identifier, stable for the entity's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(id: impl Into<String>) -> Self {
        Identifier(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// MemberRef
// ---------------------------------------------------------------------------

/// Which identifier space a set of member references is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberSpace {
    Name,
    Identifier,
}

impl fmt::Display for MemberSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberSpace::Name => f.write_str("name"),
            MemberSpace::Identifier => f.write_str("identifier"),
        }
    }
}

/// A reference to a member entity, either by human-readable name or by the
/// authority's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MemberRef {
    Name(String),
    Identifier(Identifier),
}

impl MemberRef {
    pub fn name(name: impl Into<String>) -> Self {
        MemberRef::Name(name.into())
    }

    pub fn identifier(id: impl Into<String>) -> Self {
        MemberRef::Identifier(Identifier::new(id))
    }

    pub fn space(&self) -> MemberSpace {
        match self {
            MemberRef::Name(_) => MemberSpace::Name,
            MemberRef::Identifier(_) => MemberSpace::Identifier,
        }
    }

    /// The raw string form, regardless of space.
    pub fn as_str(&self) -> &str {
        match self {
            MemberRef::Name(name) => name,
            MemberRef::Identifier(id) => id.as_str(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRef::Name(name) => write!(f, "name:{}", name),
            MemberRef::Identifier(id) => write!(f, "id:{}", id),
        }
    }
}

fn check_space(
    group: &GroupHandle,
    space: MemberSpace,
    members: &BTreeSet<MemberRef>,
) -> Result<(), ReconcileError> {
    if let Some(stray) = members.iter().find(|m| m.space() != space) {
        return Err(ReconcileError::Configuration(format!(
            "group {}: member {} is not in the declared {} space",
            group, stray, space
        )));
    }
    if let Some(empty) = members.iter().find(|m| m.as_str().trim().is_empty()) {
        return Err(ReconcileError::Configuration(format!(
            "group {}: empty member reference {}",
            group, empty
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MembershipDeclaration
// ---------------------------------------------------------------------------

/// The caller-facing declaration of a group's members, in the shape a
/// configuration file carries it. Exactly one of `user_names` / `user_ids`
/// must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipDeclaration {
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// DesiredMembership
// ---------------------------------------------------------------------------

/// Target membership for one group. All members share one [`MemberSpace`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredMembership {
    group: GroupHandle,
    space: MemberSpace,
    members: BTreeSet<MemberRef>,
}

impl DesiredMembership {
    /// Build a desired membership, rejecting references outside `space`.
    pub fn new(
        group: GroupHandle,
        space: MemberSpace,
        members: impl IntoIterator<Item = MemberRef>,
    ) -> Result<Self, ReconcileError> {
        let members: BTreeSet<MemberRef> = members.into_iter().collect();
        check_space(&group, space, &members)?;
        Ok(DesiredMembership {
            group,
            space,
            members,
        })
    }

    pub fn from_names<S: AsRef<str>>(
        group: GroupHandle,
        names: &[S],
    ) -> Result<Self, ReconcileError> {
        let refs = names.iter().map(|n| MemberRef::name(n.as_ref()));
        Self::new(group, MemberSpace::Name, refs)
    }

    pub fn from_identifiers<S: AsRef<str>>(
        group: GroupHandle,
        ids: &[S],
    ) -> Result<Self, ReconcileError> {
        let refs = ids.iter().map(|i| MemberRef::identifier(i.as_ref()));
        Self::new(group, MemberSpace::Identifier, refs)
    }

    /// Validate a declaration. Declaring neither field, or both, is rejected
    /// before any remote call is made.
    pub fn from_declaration(decl: &MembershipDeclaration) -> Result<Self, ReconcileError> {
        if decl.group_id.trim().is_empty() {
            return Err(ReconcileError::Configuration(
                "group_id must not be empty".into(),
            ));
        }
        let group = GroupHandle::new(decl.group_id.clone());
        match (&decl.user_names, &decl.user_ids) {
            (Some(names), None) => Self::from_names(group, names),
            (None, Some(ids)) => Self::from_identifiers(group, ids),
            (Some(_), Some(_)) => Err(ReconcileError::Configuration(format!(
                "group {}: user_names and user_ids are mutually exclusive",
                group
            ))),
            (None, None) => Err(ReconcileError::Configuration(format!(
                "group {}: one of user_names or user_ids is required",
                group
            ))),
        }
    }

    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    pub fn space(&self) -> MemberSpace {
        self.space
    }

    pub fn members(&self) -> &BTreeSet<MemberRef> {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ActualMembership
// ---------------------------------------------------------------------------

/// Membership as reported by the authority. Always identifier space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualMembership {
    pub group: GroupHandle,
    pub members: BTreeSet<Identifier>,
}

impl ActualMembership {
    pub fn contains(&self, id: &Identifier) -> bool {
        self.members.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LocalRecord
// ---------------------------------------------------------------------------

/// The membership a previous run recorded for a group, in the space it was
/// declared in. Persisted by the caller between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub group: GroupHandle,
    pub space: MemberSpace,
    pub members: BTreeSet<MemberRef>,
}

impl LocalRecord {
    /// Reinterpret the record as the desired membership it was written from.
    pub fn to_desired(&self) -> Result<DesiredMembership, ReconcileError> {
        DesiredMembership::new(self.group.clone(), self.space, self.members.iter().cloned())
    }

    /// Render the record back into declaration form.
    pub fn to_declaration(&self) -> MembershipDeclaration {
        let values: Vec<String> = self.members.iter().map(|m| m.as_str().to_string()).collect();
        let (user_names, user_ids) = match self.space {
            MemberSpace::Name => (Some(values), None),
            MemberSpace::Identifier => (None, Some(values)),
        };
        MembershipDeclaration {
            group_id: self.group.as_str().to_string(),
            user_names,
            user_ids,
        }
    }
}

impl From<&DesiredMembership> for LocalRecord {
    fn from(desired: &DesiredMembership) -> Self {
        LocalRecord {
            group: desired.group.clone(),
            space: desired.space,
            members: desired.members.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// MembershipSnapshot
// ---------------------------------------------------------------------------

/// Membership as this caller should see it: actual membership restricted to
/// the members the caller declared, in the caller's space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub group: GroupHandle,
    pub space: MemberSpace,
    pub members: BTreeSet<MemberRef>,
    pub actual: ActualMembership,
    /// The remote group has no members at all; the caller may forget it.
    pub vacant: bool,
}

impl MembershipSnapshot {
    /// The record the caller should persist after a successful run.
    pub fn to_record(&self) -> LocalRecord {
        LocalRecord {
            group: self.group.clone(),
            space: self.space,
            members: self.members.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
