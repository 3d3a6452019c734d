use std::sync::Arc;

use sha2::{Digest, Sha256};
use shipyard_core::{ReleaseTarget, RolloutType, RuleType, SharedClock};
use shipyard_state::Store;

use crate::error::{PolicyError, PolicyResult};
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of, shift_seconds};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Acklam's rational approximation of the standard normal quantile.
fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const LOW: f64 = 0.02425;

    let p = p.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
    if p < LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Seconds after version creation at which the target at `position`
/// (0-based, out of `total`) is admitted. Saturates at `u64::MAX`.
///
/// - linear: `position * scale`
/// - exponential: `floor(log2(position + 1)) * scale`, so each step admits
///   twice as many targets as the previous one
/// - normal: quantile `(position + 1) / (total + 1)` of a normal
///   distribution with mean `total * scale / 2` and deviation
///   `total * scale / 6`, clamped at zero
pub fn rollout_offset_seconds(
    rollout_type: RolloutType,
    position: usize,
    total: usize,
    time_scale_interval: u64,
) -> u64 {
    let scale = time_scale_interval as f64;
    let offset = match rollout_type {
        RolloutType::Linear => position as f64 * scale,
        RolloutType::Exponential => ((position + 1) as f64).log2().floor() * scale,
        RolloutType::Normal => {
            let n = total.max(1) as f64;
            let mean = n * scale / 2.0;
            let deviation = n * scale / 6.0;
            let quantile = (position + 1) as f64 / (n + 1.0);
            (mean + deviation * inverse_normal_cdf(quantile)).max(0.0)
        }
    };
    offset.round() as u64
}

fn rollout_hash(version_id: &str, target: &ReleaseTarget) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version_id.as_bytes());
    hasher.update(target.key().as_bytes());
    hex::encode(hasher.finalize())
}

/// Admits the targets of one (deployment, environment) over time.
pub struct GradualRolloutEvaluator {
    rule_id: String,
    rollout_type: RolloutType,
    time_scale_interval: u64,
    store: Arc<Store>,
    clock: SharedClock,
}

impl GradualRolloutEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        rollout_type: RolloutType,
        time_scale_interval: u64,
        store: Arc<Store>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rollout_type,
            time_scale_interval,
            store,
            clock,
        }
    }

    /// Deterministic rollout order of the target's peers for a version.
    fn ordered_peers(&self, version_id: &str, target: &ReleaseTarget) -> Vec<ReleaseTarget> {
        let mut peers: Vec<(String, ReleaseTarget)> = self
            .store
            .targets_where(|t| {
                t.deployment_id == target.deployment_id && t.environment_id == target.environment_id
            })
            .into_iter()
            .map(|t| (rollout_hash(version_id, &t), t))
            .collect();
        peers.sort();
        peers.into_iter().map(|(_, t)| t).collect()
    }
}

impl Evaluator for GradualRolloutEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::GradualRollout
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::GradualRollout)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET | ScopeFields::VERSION
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let peers = self.ordered_peers(&scope.version.id, &scope.target);
        let position = peers
            .iter()
            .position(|t| t == &scope.target)
            .ok_or_else(|| PolicyError::Evaluation {
                rule_id: self.rule_id.clone(),
                reason: format!("release target {} is not materialized", scope.target),
            })?;
        let offset = rollout_offset_seconds(
            self.rollout_type,
            position,
            peers.len(),
            self.time_scale_interval,
        );
        let admitted_at = shift_seconds(&self.rule_id, scope.version.created_at, offset)?;
        let evaluation = if self.clock.now() >= admitted_at {
            RuleEvaluation::allow("rollout reached release target")
        } else {
            RuleEvaluation::deny(format!(
                "rollout position {} of {} admitted at {}",
                position + 1,
                peers.len(),
                admitted_at.to_rfc3339()
            ))
            .retry_at(admitted_at)
        };
        Ok(evaluation
            .detail("position", position)
            .detail("total", peers.len())
            .detail("admittedAt", admitted_at.to_rfc3339()))
    }
}
