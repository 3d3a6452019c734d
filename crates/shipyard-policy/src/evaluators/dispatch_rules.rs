//! Rules consulted by job dispatch rather than by release selection.
//!
//! All three evaluate the release implied by the scope: the scope's
//! target paired with its candidate version.

use std::sync::Arc;

use shipyard_core::{
    BackoffStrategy, Job, JobStatus, Release, RuleType, SharedClock, VerificationMetric,
    VerificationStatus, VerificationTrigger,
};
use shipyard_state::Store;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of, shift_seconds};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Jobs of the scope's release, oldest first.
fn release_jobs(store: &Store, scope: &EvaluatorScope) -> Vec<Job> {
    let release_id = Release::derive_id(&scope.target, &scope.version.id);
    let mut jobs = store.jobs.filter(|j| j.release_id == release_id);
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    jobs
}

fn status_name(status: JobStatus) -> serde_json::Value {
    serde_json::to_value(status).unwrap_or_default()
}

// ── Retry ─────────────────────────────────────────────────────────

pub struct RetryEvaluator {
    rule_id: String,
    max_retries: u32,
    backoff_strategy: BackoffStrategy,
    backoff_seconds: u64,
    max_backoff_seconds: Option<u64>,
    retry_on_statuses: Vec<JobStatus>,
    store: Arc<Store>,
    clock: SharedClock,
}

impl RetryEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: impl Into<String>,
        max_retries: u32,
        backoff_strategy: BackoffStrategy,
        backoff_seconds: u64,
        max_backoff_seconds: Option<u64>,
        retry_on_statuses: Vec<JobStatus>,
        store: Arc<Store>,
        clock: SharedClock,
    ) -> Self {
        let retry_on_statuses = if retry_on_statuses.is_empty() {
            vec![JobStatus::Failure, JobStatus::InvalidIntegration]
        } else {
            retry_on_statuses
        };
        Self {
            rule_id: rule_id.into(),
            max_retries,
            backoff_strategy,
            backoff_seconds,
            max_backoff_seconds,
            retry_on_statuses,
            store,
            clock,
        }
    }

    /// Backoff in seconds before the attempt following `failures` failed
    /// ones.
    pub fn backoff_after(&self, failures: u32) -> u64 {
        let base = self.backoff_seconds;
        let seconds = match self.backoff_strategy {
            BackoffStrategy::Linear => base.saturating_mul(u64::from(failures)),
            BackoffStrategy::Exponential => {
                let exponent = failures.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << exponent)
            }
        };
        match self.max_backoff_seconds {
            Some(max) => seconds.min(max),
            None => seconds,
        }
    }
}

impl Evaluator for RetryEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::Retry
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::Retry)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET | ScopeFields::VERSION
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let failures: Vec<Job> = release_jobs(&self.store, scope)
            .into_iter()
            .filter(|j| self.retry_on_statuses.contains(&j.status))
            .collect();
        let attempts = failures.len() as u32;
        let Some(last) = failures.iter().filter_map(|j| j.finished_at()).max() else {
            return Ok(RuleEvaluation::allow("no failed attempts").detail("attempts", 0));
        };

        if attempts > self.max_retries {
            return Ok(RuleEvaluation::deny(format!(
                "retry budget exhausted: {attempts} failed attempts, {} retries allowed",
                self.max_retries
            ))
            .detail("attempts", attempts)
            .detail("maxRetries", self.max_retries));
        }

        let next = shift_seconds(&self.rule_id, last, self.backoff_after(attempts))?;
        let evaluation = if self.clock.now() < next {
            RuleEvaluation::deny(format!("backing off until {}", next.to_rfc3339())).retry_at(next)
        } else {
            RuleEvaluation::allow(format!(
                "retry {attempts} of {} permitted",
                self.max_retries
            ))
        };
        Ok(evaluation
            .detail("attempts", attempts)
            .detail("maxRetries", self.max_retries))
    }
}

// ── Rollback ──────────────────────────────────────────────────────

/// Denies (rollback required) when the release's latest job ended badly.
pub struct RollbackEvaluator {
    rule_id: String,
    on_job_statuses: Vec<JobStatus>,
    on_verification_failure: bool,
    store: Arc<Store>,
}

impl RollbackEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        on_job_statuses: Vec<JobStatus>,
        on_verification_failure: bool,
        store: Arc<Store>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            on_job_statuses,
            on_verification_failure,
            store,
        }
    }
}

impl Evaluator for RollbackEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::Rollback
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::Rollback)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET | ScopeFields::VERSION
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let Some(latest) = release_jobs(&self.store, scope).pop() else {
            return Ok(RuleEvaluation::allow("release has no jobs"));
        };
        if self.on_job_statuses.contains(&latest.status) {
            return Ok(RuleEvaluation::deny(format!(
                "rollback required: job {} ended with status {:?}",
                latest.id, latest.status
            ))
            .detail("rollbackRequired", true)
            .detail("jobId", latest.id)
            .detail("jobStatus", status_name(latest.status)));
        }
        if self.on_verification_failure && latest.verification == Some(VerificationStatus::Failed) {
            return Ok(RuleEvaluation::deny(format!(
                "rollback required: verification of job {} failed",
                latest.id
            ))
            .detail("rollbackRequired", true)
            .detail("jobId", latest.id));
        }
        Ok(RuleEvaluation::allow("no rollback condition met").detail("rollbackRequired", false))
    }
}

// ── Verification ──────────────────────────────────────────────────

/// Reports the verification state of the release's triggering job.
pub struct VerificationEvaluator {
    rule_id: String,
    metrics: Vec<VerificationMetric>,
    trigger_on: VerificationTrigger,
    store: Arc<Store>,
}

impl VerificationEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        metrics: Vec<VerificationMetric>,
        trigger_on: VerificationTrigger,
        store: Arc<Store>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            metrics,
            trigger_on,
            store,
        }
    }
}

impl Evaluator for VerificationEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::Verification
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::Verification)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET | ScopeFields::VERSION
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let metric_names: Vec<String> = self.metrics.iter().map(|m| m.name.clone()).collect();
        let jobs = release_jobs(&self.store, scope);
        let trigger = match self.trigger_on {
            VerificationTrigger::JobCreated => jobs.last(),
            VerificationTrigger::JobSuccess => {
                jobs.iter().rev().find(|j| j.status == JobStatus::Successful)
            }
        };
        let Some(job) = trigger else {
            return Ok(RuleEvaluation::deny("no job to verify yet")
                .detail("verificationPending", true)
                .detail("metrics", metric_names));
        };
        let evaluation = match job.verification {
            Some(VerificationStatus::Passed) => RuleEvaluation::allow("verification passed"),
            Some(VerificationStatus::Failed) => {
                RuleEvaluation::deny("verification failed").detail("verificationPending", false)
            }
            Some(VerificationStatus::Running) | None => {
                RuleEvaluation::deny("verification pending").detail("verificationPending", true)
            }
        };
        Ok(evaluation
            .detail("jobId", job.id.clone())
            .detail("metrics", metric_names))
    }
}
