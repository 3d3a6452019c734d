//! One evaluator per rule kind.

mod approval;
mod cooldown;
mod dependency;
mod dispatch_rules;
mod progression;
mod rollout;
mod version_selector;
mod window;

pub use approval::AnyApprovalEvaluator;
pub use cooldown::VersionCooldownEvaluator;
pub use dependency::DeploymentDependencyEvaluator;
pub use dispatch_rules::{RetryEvaluator, RollbackEvaluator, VerificationEvaluator};
pub use progression::EnvironmentProgressionEvaluator;
pub use rollout::{GradualRolloutEvaluator, rollout_offset_seconds};
pub use version_selector::VersionSelectorEvaluator;
pub use window::DeploymentWindowEvaluator;
