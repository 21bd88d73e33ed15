//! Identifier resolver: maps member names to authority identifiers.
//!
//! Lookups run under the read retry budget. A definitive "no such entity" is
//! a `Resolution::NotFound` value, never an error, so callers can decide
//! whether absence matters (it does for additions, not for removals).
//! Results are memoised for the session that owns the resolver only.

use std::cell::RefCell;
use std::collections::BTreeMap;

use tracing::debug;

use crate::authority::Authority;
use crate::convergence::retry::{CallKind, Retrier};
use crate::error::ReconcileError;
use crate::types::{Identifier, MemberRef};

/// Outcome of resolving one member reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Identifier),
    NotFound,
}

impl Resolution {
    pub fn identifier(&self) -> Option<&Identifier> {
        match self {
            Resolution::Found(id) => Some(id),
            Resolution::NotFound => None,
        }
    }
}

pub struct IdentifierResolver<'s> {
    authority: &'s dyn Authority,
    retrier: &'s Retrier<'s>,
    cache: RefCell<BTreeMap<String, Resolution>>,
}

impl<'s> IdentifierResolver<'s> {
    pub fn new(authority: &'s dyn Authority, retrier: &'s Retrier<'s>) -> Self {
        IdentifierResolver {
            authority,
            retrier,
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    /// Resolve a single name.
    pub fn resolve(&self, name: &str) -> Result<Resolution, ReconcileError> {
        if name.trim().is_empty() {
            return Err(ReconcileError::Configuration(
                "cannot resolve an empty member name".into(),
            ));
        }
        if let Some(hit) = self.cache.borrow().get(name) {
            return Ok(hit.clone());
        }

        let looked_up = self.retrier.call(CallKind::Read, "lookup_identifier", || {
            self.authority.lookup_identifier(name)
        });
        let resolution = match looked_up {
            Ok(Some(id)) => Resolution::Found(id),
            Ok(None) => Resolution::NotFound,
            Err(ReconcileError::Remote { source, .. }) if source.is_not_found() => {
                Resolution::NotFound
            }
            Err(e) => return Err(e),
        };
        debug!(name, ?resolution, "resolved member name");
        self.cache
            .borrow_mut()
            .insert(name.to_string(), resolution.clone());
        Ok(resolution)
    }

    /// Resolve a reference. Identifier references resolve to themselves
    /// without a remote call.
    pub fn resolve_ref(&self, member: &MemberRef) -> Result<Resolution, ReconcileError> {
        match member {
            MemberRef::Name(name) => self.resolve(name),
            MemberRef::Identifier(id) => Ok(Resolution::Found(id.clone())),
        }
    }

    /// Resolve every reference. Fails only on errors other than not-found.
    pub fn resolve_all<'m>(
        &self,
        members: impl IntoIterator<Item = &'m MemberRef>,
    ) -> Result<BTreeMap<MemberRef, Resolution>, ReconcileError> {
        let mut resolved = BTreeMap::new();
        for member in members {
            let resolution = self.resolve_ref(member)?;
            resolved.insert(member.clone(), resolution);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::memory::{AuthorityCall, AuthorityOp, InMemoryAuthority};
    use crate::convergence::clock::ManualClock;
    use crate::convergence::retry::{Deadline, RetryPolicy};
    use crate::error::RemoteError;
    use crate::observer::NoopObserver;
    use crate::types::BackoffStrategy;

    fn retrier(clock: &ManualClock) -> Retrier<'_> {
        Retrier::new(
            RetryPolicy::new(2, BackoffStrategy::Fixed, 10),
            RetryPolicy::new(2, BackoffStrategy::Fixed, 10),
            Deadline::start(clock, None),
            clock,
            &NoopObserver,
        )
    }

    #[test]
    fn resolves_known_and_unknown_names() {
        let authority = InMemoryAuthority::new().with_user("alice", "100");
        let clock = ManualClock::new();
        let r = retrier(&clock);
        let resolver = IdentifierResolver::new(&authority, &r);
        assert_eq!(
            resolver.resolve("alice").unwrap(),
            Resolution::Found(Identifier::new("100"))
        );
        assert_eq!(resolver.resolve("ghost").unwrap(), Resolution::NotFound);
    }

    #[test]
    fn not_found_error_code_is_a_resolution_not_an_error() {
        let authority = InMemoryAuthority::new();
        authority.fail_next(AuthorityOp::Lookup, RemoteError::not_found("gone"));
        let clock = ManualClock::new();
        let r = retrier(&clock);
        let resolver = IdentifierResolver::new(&authority, &r);
        assert_eq!(resolver.resolve("bob").unwrap(), Resolution::NotFound);
        assert_eq!(authority.calls().len(), 1);
    }

    #[test]
    fn transient_lookup_failures_are_retried() {
        let authority = InMemoryAuthority::new().with_user("alice", "100");
        authority.fail_next(AuthorityOp::Lookup, RemoteError::transient("throttled"));
        let clock = ManualClock::new();
        let r = retrier(&clock);
        let resolver = IdentifierResolver::new(&authority, &r);
        assert!(matches!(resolver.resolve("alice").unwrap(), Resolution::Found(_)));
        assert_eq!(r.retries_used(), 1);
    }

    #[test]
    fn permanent_lookup_failure_propagates() {
        let authority = InMemoryAuthority::new();
        authority.fail_next(
            AuthorityOp::Lookup,
            RemoteError::permanent("AuthFailure", "bad signature"),
        );
        let clock = ManualClock::new();
        let r = retrier(&clock);
        let resolver = IdentifierResolver::new(&authority, &r);
        assert!(matches!(
            resolver.resolve("alice"),
            Err(ReconcileError::Remote { .. })
        ));
    }

    #[test]
    fn identifiers_need_no_lookup_and_names_are_cached() {
        let authority = InMemoryAuthority::new().with_user("alice", "100");
        let clock = ManualClock::new();
        let r = retrier(&clock);
        let resolver = IdentifierResolver::new(&authority, &r);
        let refs = vec![
            MemberRef::identifier("7"),
            MemberRef::name("alice"),
            MemberRef::name("alice"),
        ];
        let resolved = resolver.resolve_all(&refs).unwrap();
        assert_eq!(resolved.len(), 2);
        resolver.resolve("alice").unwrap();
        assert_eq!(
            authority.calls(),
            vec![AuthorityCall::Lookup("alice".into())]
        );
    }

    #[test]
    fn empty_name_is_configuration_error() {
        let authority = InMemoryAuthority::new();
        let clock = ManualClock::new();
        let r = retrier(&clock);
        let resolver = IdentifierResolver::new(&authority, &r);
        assert!(matches!(
            resolver.resolve(" "),
            Err(ReconcileError::Configuration(_))
        ));
        assert!(authority.calls().is_empty());
    }
}
