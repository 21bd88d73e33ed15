//! The remote authority that owns group membership.
//!
//! `Authority` is the narrow capability the engine needs from the transport
//! layer. Production clients implement it over the real service; `memory`
//! provides an in-process implementation with fault injection for tests and
//! local simulation.

pub mod memory;

use std::collections::BTreeSet;

use crate::error::RemoteError;
use crate::types::{GroupHandle, Identifier};

/// Calls the reconciliation engine issues against the remote service.
///
/// Every call is a blocking request/response. Implementations classify their
/// failures through `RemoteError::kind` so the engine knows what to retry.
pub trait Authority: Send + Sync {
    /// Resolve a member name. `Ok(None)` means the entity does not exist.
    fn lookup_identifier(&self, name: &str) -> Result<Option<Identifier>, RemoteError>;

    /// The complete current membership of `group`.
    fn list_members(&self, group: &GroupHandle) -> Result<BTreeSet<Identifier>, RemoteError>;

    /// Add every identifier in one batch. Adding a present member is a no-op.
    fn add_members(
        &self,
        group: &GroupHandle,
        members: &BTreeSet<Identifier>,
    ) -> Result<(), RemoteError>;

    /// Remove every identifier in one batch. Removing an absent member is a no-op.
    fn remove_members(
        &self,
        group: &GroupHandle,
        members: &BTreeSet<Identifier>,
    ) -> Result<(), RemoteError>;
}
