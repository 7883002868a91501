//! State Management Module
//!
//! Tracks this replica's leader/follower role. The role is decided
//! elsewhere; this module only records and publishes it.

mod role;

pub use role::{Role, RoleTracker};
