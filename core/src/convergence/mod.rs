//! Convergence engine: drives remote group membership toward a declaration.
//!
//! `planner` computes the minimal additions and removals, `resolver` maps
//! names into identifier space, `executor` applies one batch per direction,
//! and `retry` bounds every remote call with separate read and write budgets
//! under a session deadline. `session` ties these together for one operation
//! and `controller` exposes the create/read/update/delete lifecycle.

pub mod clock;
pub mod controller;
pub mod executor;
pub mod planner;
pub mod reader;
pub mod resolver;
pub mod retry;
pub mod session;
