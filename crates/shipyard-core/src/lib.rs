//! shipyard-core: the data model shared by every Shipyard crate.
//!
//! # Contents
//!
//! - **`types`**: workspaces, systems, resources, deployments, versions,
//!   environments, release targets, releases, jobs, approvals, variables
//!   and relationship rules, plus the [`Entity`] sum type
//! - **`policy`**: policies, target selectors and the tagged rule variants
//! - **`changeset`**: buffered entity mutations with per-key coalescing
//! - **`clock`**: injectable wall clock (system and manual)
//! - **`config`**: `shipyard.toml` parsing

pub mod changeset;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod types;

pub use changeset::{Change, ChangeKind, ChangeSet};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    ChangelogSection, EngineConfig, QueueSection, ShipyardConfig, StorageBackend, WorkerSection,
};
pub use error::{CoreError, CoreResult};
pub use policy::*;
pub use types::*;
