//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row structs returned by queries, with conversions into domain types.
//! - `repo`: SQL-only functions for the ledger, the registry and run-locks.
//!
//! Callers import from `content_hooks::db`; the repository API is re-exported
//! here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{LockRow, PendingChangeRow, SubscriptionRow};
