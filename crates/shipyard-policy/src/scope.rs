//! What an evaluator sees: one release target and one candidate version.

use std::fmt;
use std::ops::BitOr;

use shipyard_core::{Deployment, DeploymentVersion, Environment, ReleaseTarget, Resource};

/// Subset of scope fields an evaluator consults; keys memoized results.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeFields(u8);

impl ScopeFields {
    pub const NONE: Self = Self(0);
    pub const DEPLOYMENT: Self = Self(1);
    pub const ENVIRONMENT: Self = Self(1 << 1);
    pub const RESOURCE: Self = Self(1 << 2);
    pub const VERSION: Self = Self(1 << 3);
    pub const RELEASE_TARGET: Self = Self(1 << 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ScopeFields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ScopeFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::DEPLOYMENT, "Deployment"),
            (Self::ENVIRONMENT, "Environment"),
            (Self::RESOURCE, "Resource"),
            (Self::VERSION, "Version"),
            (Self::RELEASE_TARGET, "ReleaseTarget"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ScopeFields({})", set.join("|"))
    }
}

/// One release target with one candidate version.
#[derive(Debug, Clone)]
pub struct EvaluatorScope {
    pub target: ReleaseTarget,
    pub deployment: Deployment,
    pub environment: Environment,
    pub resource: Resource,
    pub version: DeploymentVersion,
}

impl EvaluatorScope {
    /// Stable key over the requested fields, used for memoization.
    pub fn fingerprint(&self, fields: ScopeFields) -> String {
        let mut parts = Vec::with_capacity(5);
        if fields.contains(ScopeFields::DEPLOYMENT) {
            parts.push(format!("d={}", self.deployment.id));
        }
        if fields.contains(ScopeFields::ENVIRONMENT) {
            parts.push(format!("e={}", self.environment.id));
        }
        if fields.contains(ScopeFields::RESOURCE) {
            parts.push(format!("r={}", self.resource.id));
        }
        if fields.contains(ScopeFields::VERSION) {
            parts.push(format!("v={}", self.version.id));
        }
        if fields.contains(ScopeFields::RELEASE_TARGET) {
            parts.push(format!("t={}", self.target.key()));
        }
        parts.join("|")
    }
}
