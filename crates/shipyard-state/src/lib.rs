//! shipyard-state: in-memory entity stores for Shipyard.
//!
//! Each entity kind lives in a [`Repository`] backed by a
//! [`ShardedMap`](shipyard_collections::ShardedMap). Every mutation records a
//! [`Change`](shipyard_core::Change) into a recorder shared by the whole
//! [`Store`]; the orchestrator drains it with [`Store::take_changes`] and
//! feeds the result to the indexes.
//!
//! The store also owns the derived tables: materialized release targets,
//! the desired release per target, and the last reconcile report per target.

pub mod error;
pub mod queries;
pub mod report;
pub mod repository;
pub mod store;

pub use error::{StateError, StateResult};
pub use report::{ReconcileReport, RuleOutcome, VersionDecision};
pub use repository::{ChangeRecorder, Repository, StoredEntity};
pub use store::Store;
