//! shipyard-index: reactive indexes over entity ids.
//!
//! Both indexes track dirty flags and re-evaluate only what changed when
//! [`recompute`](ComputeIndex::recompute) is called. User callbacks always
//! run outside the index lock, in a bounded pool of scoped threads; a
//! result is applied only if its ids are still registered when the batch
//! finishes.
//!
//! - [`ComputeIndex`]: one computed value per registered id
//! - [`MatchIndex`]: which selectors match which entities, queryable in
//!   both directions

pub mod compute;
pub mod error;
pub mod matcher;
pub mod parallel;

pub use compute::{ComputeFn, ComputeIndex};
pub use error::{IndexError, IndexResult};
pub use matcher::{MatchFn, MatchIndex};
pub use parallel::Concurrency;
