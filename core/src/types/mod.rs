pub mod config;
pub mod member;

pub use config::{BackoffStrategy, ReconcileSettings};
pub use member::{
    ActualMembership, DesiredMembership, GroupHandle, Identifier, LocalRecord, MemberRef,
    MemberSpace, MembershipDeclaration, MembershipSnapshot,
};
