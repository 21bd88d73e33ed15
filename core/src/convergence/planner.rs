//! Diff engine: compares desired and actual membership and emits the
//! minimal additions and removals.
//!
//! The planner is stateless and performs no I/O: resolution results are
//! passed in. Comparison is purely by identifier equality, so `to_add` and
//! `to_remove` are disjoint by construction.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::convergence::resolver::Resolution;
use crate::types::{Identifier, MemberRef};

/// Additions and removals needed to converge, plus the desired references
/// that could not be resolved and are therefore left out of `to_add`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub to_add: BTreeSet<MemberRef>,
    pub to_remove: BTreeSet<MemberRef>,
    pub unresolved: BTreeSet<MemberRef>,
}

impl Diff {
    /// Whether no mutation is required.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Produce a human-readable summary of the diff.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.to_add.is_empty() {
            parts.push(format!("{} member(s) to add", self.to_add.len()));
        }
        if !self.to_remove.is_empty() {
            parts.push(format!("{} member(s) to remove", self.to_remove.len()));
        }
        if !self.unresolved.is_empty() {
            parts.push(format!("{} unresolved", self.unresolved.len()));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// How a desired reference maps onto identifier space. References missing
/// from `resolved` fall back to their own identifier, or count as unresolved
/// names.
fn lookup(member: &MemberRef, resolved: &BTreeMap<MemberRef, Resolution>) -> Option<Identifier> {
    match resolved.get(member) {
        Some(resolution) => resolution.identifier().cloned(),
        None => match member {
            MemberRef::Identifier(id) => Some(id.clone()),
            MemberRef::Name(_) => None,
        },
    }
}

/// Compute the diff between `desired` and the authority's `actual` set.
///
/// 1. Desired references resolving to an identifier already in `actual` are
///    kept; those resolving to an identifier not in `actual` go to `to_add`
///    (in the desired space); unresolvable ones go to `unresolved`.
/// 2. Every actual identifier not kept goes to `to_remove`.
pub fn diff(
    desired: &BTreeSet<MemberRef>,
    actual: &BTreeSet<Identifier>,
    resolved: &BTreeMap<MemberRef, Resolution>,
) -> Diff {
    let mut out = Diff::default();
    let mut present: BTreeSet<&Identifier> = BTreeSet::new();

    for member in desired {
        match lookup(member, resolved) {
            Some(id) => match actual.get(&id) {
                Some(existing) => {
                    present.insert(existing);
                }
                None => {
                    out.to_add.insert(member.clone());
                }
            },
            None => {
                out.unresolved.insert(member.clone());
            }
        }
    }

    for id in actual {
        if !present.contains(id) {
            out.to_remove.insert(MemberRef::Identifier(id.clone()));
        }
    }

    out
}

/// Declaration-level diff between a previous and a new desired set in the
/// same space: `to_add = to \ from`, `to_remove = from \ to`.
pub fn diff_declarations(from: &BTreeSet<MemberRef>, to: &BTreeSet<MemberRef>) -> Diff {
    Diff {
        to_add: to.difference(from).cloned().collect(),
        to_remove: from.difference(to).cloned().collect(),
        unresolved: BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(values: &[&str]) -> BTreeSet<MemberRef> {
        values.iter().map(|v| MemberRef::name(*v)).collect()
    }

    fn ids(values: &[&str]) -> BTreeSet<Identifier> {
        values.iter().map(|v| Identifier::new(*v)).collect()
    }

    fn directory() -> BTreeMap<MemberRef, Resolution> {
        [("alice", "1"), ("bob", "2"), ("carol", "3")]
            .iter()
            .map(|(n, i)| (MemberRef::name(*n), Resolution::Found(Identifier::new(*i))))
            .chain(std::iter::once((MemberRef::name("ghost"), Resolution::NotFound)))
            .collect()
    }

    #[test]
    fn create_into_empty_group() {
        let d = diff(&names(&["alice", "bob"]), &ids(&[]), &directory());
        assert_eq!(d.to_add, names(&["alice", "bob"]));
        assert!(d.to_remove.is_empty());
    }

    #[test]
    fn out_of_band_member_is_removed() {
        let d = diff(&names(&["alice"]), &ids(&["1", "2"]), &directory());
        assert!(d.to_add.is_empty());
        assert_eq!(d.to_remove, [MemberRef::identifier("2")].into_iter().collect());
    }

    #[test]
    fn empty_desired_removes_everything() {
        let d = diff(&BTreeSet::new(), &ids(&["1", "9"]), &directory());
        assert_eq!(d.to_remove.len(), 2);
        assert!(d.to_add.is_empty());
    }

    #[test]
    fn unresolved_never_reaches_to_add() {
        let d = diff(&names(&["ghost", "alice"]), &ids(&[]), &directory());
        assert_eq!(d.to_add, names(&["alice"]));
        assert_eq!(d.unresolved, names(&["ghost"]));
    }

    #[test]
    fn missing_resolution_for_name_counts_as_unresolved() {
        let d = diff(&names(&["dave"]), &ids(&[]), &BTreeMap::new());
        assert_eq!(d.unresolved, names(&["dave"]));
    }

    #[test]
    fn identifier_space_needs_no_resolution() {
        let desired: BTreeSet<MemberRef> =
            [MemberRef::identifier("1"), MemberRef::identifier("4")].into_iter().collect();
        let d = diff(&desired, &ids(&["1", "2"]), &BTreeMap::new());
        assert_eq!(d.to_add, [MemberRef::identifier("4")].into_iter().collect());
        assert_eq!(d.to_remove, [MemberRef::identifier("2")].into_iter().collect());
    }

    #[test]
    fn no_changes_produces_empty() {
        let d = diff(&names(&["alice", "bob"]), &ids(&["1", "2"]), &directory());
        assert!(d.is_empty());
        assert_eq!(d.summary(), "no changes");
    }

    #[test]
    fn update_declarations() {
        let d = diff_declarations(&names(&["alice", "bob"]), &names(&["bob", "carol"]));
        assert_eq!(d.to_remove, names(&["alice"]));
        assert_eq!(d.to_add, names(&["carol"]));
        assert_eq!(d.summary(), "1 member(s) to add, 1 member(s) to remove");
    }

    fn arb_world() -> impl Strategy<Value = (Vec<(u8, Option<u8>)>, BTreeSet<u8>)> {
        (
            prop::collection::vec((0u8..16, prop::option::weighted(0.8, 0u8..16)), 0..10),
            prop::collection::btree_set(0u8..16, 0..10),
        )
    }

    proptest! {
        #[test]
        fn diff_is_total_and_disjoint((entries, actual) in arb_world()) {
            let mut desired = BTreeSet::new();
            let mut resolved = BTreeMap::new();
            for (name, target) in &entries {
                let member = MemberRef::name(format!("user{}", name));
                let resolution = match target {
                    Some(id) => Resolution::Found(Identifier::new(id.to_string())),
                    None => Resolution::NotFound,
                };
                resolved.entry(member.clone()).or_insert(resolution);
                desired.insert(member);
            }
            let actual: BTreeSet<Identifier> =
                actual.iter().map(|i| Identifier::new(i.to_string())).collect();

            let d = diff(&desired, &actual, &resolved);

            let add_ids: BTreeSet<Identifier> = d
                .to_add
                .iter()
                .filter_map(|m| resolved.get(m).and_then(|r| r.identifier().cloned()))
                .collect();
            let remove_ids: BTreeSet<Identifier> = d
                .to_remove
                .iter()
                .map(|m| Identifier::new(m.as_str()))
                .collect();
            prop_assert!(add_ids.is_disjoint(&remove_ids));

            // Applying the diff lands exactly on the resolvable desired set.
            let wanted: BTreeSet<Identifier> = desired
                .iter()
                .filter_map(|m| resolved.get(m).and_then(|r| r.identifier().cloned()))
                .collect();
            let after: BTreeSet<Identifier> = actual
                .difference(&remove_ids)
                .cloned()
                .chain(add_ids.iter().cloned())
                .collect();
            prop_assert_eq!(after, wanted);

            for member in &d.unresolved {
                prop_assert!(!d.to_add.contains(member));
            }
        }
    }
}
