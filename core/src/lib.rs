//! Roster: converges the declared membership of remote groups with what the
//! remote authority actually holds.
//!
//! The engine is synchronous and talks to the authority only through the
//! [`authority::Authority`] trait. [`convergence::controller::Reconciler`] is
//! the entry point; it runs one session per operation.

pub mod authority;
pub mod convergence;
pub mod error;
pub mod observer;
pub mod settings;
pub mod types;

pub use authority::memory::{AuthorityState, InMemoryAuthority};
pub use authority::Authority;
pub use convergence::clock::{Clock, ManualClock, SystemClock};
pub use convergence::controller::{Reconciled, Reconciler};
pub use convergence::planner::Diff;
pub use convergence::session::LifecycleState;
pub use error::{ReconcileError, RemoteError, SettingsError};
pub use observer::{NoopObserver, ReconcileEvent, ReconcileObserver, TracingObserver};
pub use types::*;
