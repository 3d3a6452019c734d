//! shipyard-policy: policy rule evaluation.
//!
//! Every [`Rule`](shipyard_core::Rule) variant has an [`Evaluator`]. The
//! [`EvaluatorFactory`] maps rules to evaluators and wraps the ones whose
//! result depends only on store state in a memoizing decorator. The
//! [`Pipeline`] runs the release-gating evaluators for one candidate
//! version, cheapest first, stopping at the first denial.
//!
//! Retry, rollback and verification rules do not gate releases; the
//! [`DispatchGate`] exposes them to a job dispatcher.

pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod evaluators;
pub mod factory;
pub mod lookup;
pub mod memo;
pub mod pipeline;
pub mod scope;

pub use dispatch::{DispatchDecision, DispatchGate};
pub use error::{PolicyError, PolicyResult};
pub use evaluator::{Evaluator, RuleEvaluation};
pub use factory::EvaluatorFactory;
pub use lookup::{PolicyLookup, StaticPolicies};
pub use memo::{MemoCache, MemoizedEvaluator};
pub use pipeline::{Pipeline, PipelineDecision};
pub use scope::{EvaluatorScope, ScopeFields};
