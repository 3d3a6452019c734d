//! shipyard-targets: the derived release-target graph.
//!
//! # Components
//!
//! - [`Materializer`]: which (deployment, environment, resource) triples
//!   exist, derived from two match indexes (environment and deployment
//!   selectors over resources)
//! - [`TaintProcessor`]: which existing targets a change set affects
//! - [`RelationshipIndex`]: rule-driven edges between resources,
//!   deployments and environments, matched with CEL
//! - [`PolicyTargetIndex`]: which policies apply to which targets

pub mod error;
pub mod materializer;
pub mod policy_targets;
pub mod relationships;
pub mod taint;

pub use error::{TargetsError, TargetsResult};
pub use materializer::{Materializer, TargetDiff};
pub use policy_targets::PolicyTargetIndex;
pub use relationships::{Direction, RelatedEntity, RelationshipIndex};
pub use taint::{TaintProcessor, TaintResult, TargetChanges};
