//! Access to the policies applying to a release target.

use shipyard_core::{Policy, ReleaseTarget};
use shipyard_targets::PolicyTargetIndex;

pub trait PolicyLookup: Send + Sync {
    /// Policies applying to `target`, highest priority first.
    fn policies_for(&self, target: &ReleaseTarget) -> Vec<Policy>;
}

impl PolicyLookup for PolicyTargetIndex {
    fn policies_for(&self, target: &ReleaseTarget) -> Vec<Policy> {
        PolicyTargetIndex::policies_for(self, target)
    }
}

/// A fixed policy list applied to every target.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicies(pub Vec<Policy>);

impl PolicyLookup for StaticPolicies {
    fn policies_for(&self, _target: &ReleaseTarget) -> Vec<Policy> {
        self.0.clone()
    }
}
