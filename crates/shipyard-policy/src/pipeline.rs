//! Ordered, short-circuiting evaluation of release-gating rules.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shipyard_core::Policy;
use shipyard_state::RuleOutcome;
use tracing::{debug, field, warn};

use crate::evaluator::{Evaluator, RuleEvaluation};
use crate::factory::EvaluatorFactory;
use crate::scope::EvaluatorScope;

/// Runs one evaluator; an evaluation error becomes a denial with no
/// future evaluation time.
pub(crate) fn run_evaluator(evaluator: &dyn Evaluator, scope: &EvaluatorScope) -> RuleOutcome {
    let evaluation = match evaluator.evaluate(scope) {
        Ok(evaluation) => evaluation,
        Err(err) => {
            warn!(
                rule_id = %evaluator.rule_id(),
                rule_type = %evaluator.rule_type(),
                error = %err,
                "rule evaluation failed"
            );
            RuleEvaluation::deny(format!("rule evaluation failed: {err}"))
                .detail("error", err.to_string())
        }
    };
    evaluation.into_outcome(evaluator.rule_id(), evaluator.rule_type())
}

/// Verdict of a pipeline for one candidate version.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDecision {
    pub allowed: bool,
    /// Earliest time a denial may lift on its own.
    pub next_evaluation_time: Option<DateTime<Utc>>,
    pub short_circuited: bool,
    pub outcomes: Vec<RuleOutcome>,
}

/// Release-gating evaluators of a set of policies, cheapest first.
#[derive(Clone, Default)]
pub struct Pipeline {
    evaluators: Vec<Arc<dyn Evaluator>>,
}

impl Pipeline {
    /// Keeps enabled policies' release-gating rules. Policies arrive
    /// highest priority first; the sort by complexity is stable so that
    /// order survives among equally complex rules.
    pub fn build(policies: &[Policy], factory: &EvaluatorFactory) -> Self {
        let mut evaluators: Vec<Arc<dyn Evaluator>> = policies
            .iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.rules.iter())
            .filter(|r| r.rule.rule_type().gates_release())
            .map(|r| factory.build(r))
            .collect();
        evaluators.sort_by_key(|e| e.complexity());
        Self { evaluators }
    }

    pub fn from_evaluators(mut evaluators: Vec<Arc<dyn Evaluator>>) -> Self {
        evaluators.sort_by_key(|e| e.complexity());
        Self { evaluators }
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.evaluators.iter().map(|e| e.rule_id()).collect()
    }

    #[tracing::instrument(
        name = "Pipeline.Evaluate",
        skip_all,
        fields(
            target = %scope.target,
            version_id = %scope.version.id,
            rules = self.evaluators.len(),
            decision.can_deploy = field::Empty,
            evaluation.short_circuited = field::Empty,
        )
    )]
    pub fn evaluate(&self, scope: &EvaluatorScope) -> PipelineDecision {
        let mut outcomes = Vec::with_capacity(self.evaluators.len());
        let mut next_evaluation_time: Option<DateTime<Utc>> = None;
        let mut allowed = true;

        for (i, evaluator) in self.evaluators.iter().enumerate() {
            let outcome = run_evaluator(evaluator.as_ref(), scope);
            let denied = !outcome.allowed;
            if denied {
                allowed = false;
                if let Some(at) = outcome.next_evaluation_time {
                    next_evaluation_time = Some(next_evaluation_time.map_or(at, |n| n.min(at)));
                }
                debug!(rule_id = %outcome.rule_id, reason = %outcome.reason, "rule denied");
            }
            outcomes.push(outcome);
            if denied {
                let short_circuited = i + 1 < self.evaluators.len();
                return self.finish(false, next_evaluation_time, short_circuited, outcomes);
            }
        }
        self.finish(allowed, None, false, outcomes)
    }

    fn finish(
        &self,
        allowed: bool,
        next_evaluation_time: Option<DateTime<Utc>>,
        short_circuited: bool,
        outcomes: Vec<RuleOutcome>,
    ) -> PipelineDecision {
        let span = tracing::Span::current();
        span.record("decision.can_deploy", allowed);
        span.record("evaluation.short_circuited", short_circuited);
        PipelineDecision {
            allowed,
            next_evaluation_time,
            short_circuited,
            outcomes,
        }
    }
}
