//! shipyard-engine: turns entity changes into desired releases.
//!
//! # Components
//!
//! - [`Orchestrator`]: applies change sets, routes them to the indexes on
//!   every tick, and enqueues reconcile work for affected release targets
//! - [`DesiredReleaseReconciler`]: the queue [`Processor`](shipyard_queue::Processor)
//!   that picks the newest candidate version passing every policy rule
//! - [`VariableManager`]: resolves release variables;
//!   [`StoreVariableManager`] is the store-backed default

pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod variables;

pub use error::{EngineError, EngineResult};
pub use orchestrator::{Orchestrator, TickSummary};
pub use reconciler::{DesiredReleaseReconciler, Reconciliation};
pub use variables::{ResolvedVariables, StoreVariableManager, VariableManager};

/// Queue item kind handled by the desired-release reconciler.
pub const DESIRED_RELEASE_KIND: &str = "desired-release";

/// Scope type of desired-release work items; the scope id is the target key.
pub const RELEASE_TARGET_SCOPE: &str = "release-target";
