//! Rule evaluators, the gating pipeline and the dispatch gate against an
//! in-memory store and a manual clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use shipyard_core::*;
use shipyard_policy::*;
use shipyard_selector::Condition;
use shipyard_state::Store;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

fn secs(n: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(n)
}

struct Fixture {
    store: Arc<Store>,
    clock: Arc<ManualClock>,
    memo: Arc<MemoCache>,
}

impl Fixture {
    fn new() -> Self {
        let clock = ManualClock::shared(t0());
        let memo = Arc::new(MemoCache::new(1024, clock.clone()));
        let fixture = Self {
            store: Arc::new(Store::new()),
            clock,
            memo,
        };
        fixture.upsert(Entity::System(System {
            id: "sys".into(),
            workspace_id: "ws".into(),
            name: "sys".into(),
            slug: "sys".into(),
        }));
        fixture
    }

    fn upsert(&self, entity: Entity) {
        self.store.upsert_entity(entity).unwrap();
    }

    fn factory(&self, policies: Vec<Policy>) -> EvaluatorFactory {
        EvaluatorFactory::new(
            Arc::clone(&self.store),
            self.clock.clone(),
            Arc::new(StaticPolicies(policies)),
            Arc::clone(&self.memo),
        )
    }

    fn deployment(&self, id: &str) {
        self.upsert(Entity::Deployment(Deployment {
            id: id.into(),
            system_id: "sys".into(),
            name: id.into(),
            slug: id.into(),
            job_agent_config: ConfigMap::new(),
            resource_selector: None,
            metadata: Metadata::new(),
        }));
    }

    fn environment(&self, id: &str) {
        self.upsert(Entity::Environment(Environment {
            id: id.into(),
            system_id: "sys".into(),
            name: id.into(),
            resource_selector: None,
            metadata: Metadata::new(),
        }));
    }

    fn resource(&self, id: &str) {
        self.upsert(Entity::Resource(Resource {
            id: id.into(),
            workspace_id: "ws".into(),
            name: id.into(),
            identifier: id.into(),
            kind: "cluster".into(),
            version: "v1".into(),
            config: ConfigMap::new(),
            metadata: Metadata::new(),
            created_at: t0(),
            updated_at: None,
            deleted_at: None,
        }));
    }

    fn version(&self, id: &str, deployment: &str, created_at: DateTime<Utc>) -> DeploymentVersion {
        let version = DeploymentVersion {
            id: id.into(),
            deployment_id: deployment.into(),
            tag: id.into(),
            name: String::new(),
            status: VersionStatus::Ready,
            created_at,
            config: ConfigMap::new(),
            job_agent_config: ConfigMap::new(),
            metadata: [("channel".to_string(), "stable".to_string())].into(),
        };
        self.upsert(Entity::DeploymentVersion(version.clone()));
        version
    }

    fn target(&self, deployment: &str, environment: &str, resource: &str) -> ReleaseTarget {
        let target = ReleaseTarget::new(deployment, environment, resource);
        self.store.set_release_target(target.clone());
        target
    }

    fn release(&self, target: &ReleaseTarget, version: &str, at: DateTime<Utc>) -> Release {
        let release = Release::new(target.clone(), version, Default::default(), vec![], at);
        self.upsert(Entity::Release(release.clone()));
        release
    }

    fn job(&self, id: &str, release: &Release, status: JobStatus, at: DateTime<Utc>) {
        self.upsert(Entity::Job(Job {
            id: id.into(),
            release_id: release.id.clone(),
            status,
            created_at: at,
            updated_at: None,
            completed_at: status.is_terminal().then_some(at),
            message: None,
            verification: None,
        }));
    }

    fn scope(&self, target: &ReleaseTarget, version: &DeploymentVersion) -> EvaluatorScope {
        let deployment = self.store.deployments.get(&target.deployment_id).unwrap();
        let environment = self.store.environments.get(&target.environment_id).unwrap();
        let resource = self.store.resources.get(&target.resource_id).unwrap();
        EvaluatorScope {
            target: target.clone(),
            deployment,
            environment,
            resource,
            version: version.clone(),
        }
    }

    /// One deployment `d`, environment `prod`, resource `r1`, version `v1`.
    fn simple() -> (Self, ReleaseTarget, DeploymentVersion) {
        let fixture = Self::new();
        fixture.deployment("d");
        fixture.environment("prod");
        fixture.resource("r1");
        let version = fixture.version("v1", "d", t0());
        let target = fixture.target("d", "prod", "r1");
        (fixture, target, version)
    }
}

fn rule(id: &str, rule: Rule) -> PolicyRule {
    PolicyRule {
        id: id.into(),
        policy_id: "p".into(),
        created_at: t0(),
        rule,
    }
}

fn policy(rules: Vec<PolicyRule>) -> Policy {
    Policy {
        id: "p".into(),
        workspace_id: "ws".into(),
        name: "gates".into(),
        description: None,
        enabled: true,
        priority: 0,
        created_at: t0(),
        selectors: vec![PolicyTargetSelector::default()],
        rules,
    }
}

fn evaluate(factory: &EvaluatorFactory, rule: &PolicyRule, scope: &EvaluatorScope) -> RuleEvaluation {
    factory.build(rule).evaluate(scope).unwrap()
}

// ── Cooldown ──────────────────────────────────────────────────────

#[test]
fn cooldown_blocks_until_interval_after_previous_release() {
    let (fx, target, version) = Fixture::simple();
    fx.release(&target, "v0", secs(100));
    fx.clock.set(secs(500));

    let factory = fx.factory(vec![]);
    let cooldown = rule("cool", Rule::VersionCooldown { interval_seconds: 3600 });
    let eval = evaluate(&factory, &cooldown, &fx.scope(&target, &version));
    assert!(!eval.allowed);
    assert_eq!(eval.next_evaluation_time, Some(secs(3700)));

    fx.clock.set(secs(3700));
    assert!(evaluate(&factory, &cooldown, &fx.scope(&target, &version)).allowed);
}

#[test]
fn cooldown_allows_first_release() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    let cooldown = rule("cool", Rule::VersionCooldown { interval_seconds: 3600 });
    assert!(evaluate(&factory, &cooldown, &fx.scope(&target, &version)).allowed);
}

#[test]
fn cooldown_beyond_the_calendar_fails_the_rule() {
    let (fx, target, version) = Fixture::simple();
    fx.release(&target, "v0", secs(100));
    let factory = fx.factory(vec![]);
    let cooldown = rule(
        "cool",
        Rule::VersionCooldown {
            interval_seconds: 10u64.pow(16),
        },
    );
    let result = factory.build(&cooldown).evaluate(&fx.scope(&target, &version));
    assert!(matches!(result, Err(PolicyError::Evaluation { rule_id, .. }) if rule_id == "cool"));
}

// ── Approval ──────────────────────────────────────────────────────

#[test]
fn approval_verdict_is_memoized_until_approvals_change() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    let approval = rule("approve", Rule::AnyApproval { min_approvals: 1 });
    let scope = fx.scope(&target, &version);

    let denied = evaluate(&factory, &approval, &scope);
    assert!(!denied.allowed);
    assert_eq!(denied.next_evaluation_time, None);

    fx.upsert(Entity::UserApprovalRecord(UserApprovalRecord {
        user_id: "alice".into(),
        version_id: "v1".into(),
        environment_id: "prod".into(),
        status: ApprovalStatus::Approved,
        approved_at: secs(10),
        reason: None,
    }));
    assert!(!evaluate(&factory, &approval, &scope).allowed, "cached verdict");

    factory.on_change(EntityKind::UserApprovalRecord);
    assert!(evaluate(&factory, &approval, &scope).allowed);
}

#[test]
fn rejections_and_duplicate_users_do_not_count() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    for (user, status) in [
        ("alice", ApprovalStatus::Approved),
        ("bob", ApprovalStatus::Rejected),
    ] {
        fx.upsert(Entity::UserApprovalRecord(UserApprovalRecord {
            user_id: user.into(),
            version_id: "v1".into(),
            environment_id: "prod".into(),
            status,
            approved_at: secs(10),
            reason: None,
        }));
    }
    let approval = rule("approve", Rule::AnyApproval { min_approvals: 2 });
    let eval = evaluate(&factory, &approval, &fx.scope(&target, &version));
    assert!(!eval.allowed);
    assert_eq!(eval.details["approvals"], 1);
}

// ── Version selector ──────────────────────────────────────────────

#[test]
fn version_selector_matches_metadata() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    let scope = fx.scope(&target, &version);

    let stable = rule(
        "stable",
        Rule::VersionSelector {
            selector: Condition::metadata_equals("channel", "stable"),
        },
    );
    assert!(evaluate(&factory, &stable, &scope).allowed);

    let beta = rule(
        "beta",
        Rule::VersionSelector {
            selector: Condition::metadata_equals("channel", "beta"),
        },
    );
    assert!(!evaluate(&factory, &beta, &scope).allowed);
}

// ── Deployment dependency ─────────────────────────────────────────

#[test]
fn dependency_waits_for_successful_upstream_release() {
    let fx = Fixture::new();
    fx.deployment("upstream");
    fx.deployment("b");
    fx.environment("prod");
    fx.resource("r1");
    let version = fx.version("vb", "b", t0());
    let upstream_target = fx.target("upstream", "prod", "r1");
    let target = fx.target("b", "prod", "r1");

    let dependency = rule(
        "dep",
        Rule::DeploymentDependency {
            depends_on: Condition::name_equals("upstream"),
        },
    );
    let factory = fx.factory(vec![policy(vec![dependency.clone()])]);
    let scope = fx.scope(&target, &version);

    let denied = evaluate(&factory, &dependency, &scope);
    assert!(!denied.allowed);
    assert!(denied.reason.contains("no successful release"));

    let release = fx.release(&upstream_target, "vu", secs(10));
    fx.job("j1", &release, JobStatus::Successful, secs(20));
    factory.on_change(EntityKind::Job);
    assert!(evaluate(&factory, &dependency, &scope).allowed);

    // A newer in-flight job does not revoke the completed success.
    fx.job("j2", &release, JobStatus::InProgress, secs(30));
    factory.on_change(EntityKind::Job);
    assert!(evaluate(&factory, &dependency, &scope).allowed);

    fx.job("j3", &release, JobStatus::Failure, secs(40));
    factory.on_change(EntityKind::Job);
    assert!(!evaluate(&factory, &dependency, &scope).allowed);
}

#[test]
fn dependency_without_matching_upstream_allows() {
    let (fx, target, version) = Fixture::simple();
    let dependency = rule(
        "dep",
        Rule::DeploymentDependency {
            depends_on: Condition::name_equals("nothing"),
        },
    );
    let factory = fx.factory(vec![]);
    assert!(evaluate(&factory, &dependency, &fx.scope(&target, &version)).allowed);
}

#[test]
fn mutual_dependencies_are_reported_as_cycle() {
    let fx = Fixture::new();
    fx.deployment("a");
    fx.deployment("b");
    fx.environment("prod");
    fx.resource("r1");
    let version = fx.version("vb", "b", t0());
    fx.target("a", "prod", "r1");
    let target = fx.target("b", "prod", "r1");

    let on_a = rule(
        "on-a",
        Rule::DeploymentDependency {
            depends_on: Condition::name_equals("a"),
        },
    );
    let on_b = rule(
        "on-b",
        Rule::DeploymentDependency {
            depends_on: Condition::name_equals("b"),
        },
    );
    let factory = fx.factory(vec![policy(vec![on_a.clone(), on_b])]);
    let eval = evaluate(&factory, &on_a, &fx.scope(&target, &version));
    assert!(!eval.allowed);
    assert_eq!(eval.reason, "cycle-detected");
}

// ── Deployment window ─────────────────────────────────────────────

fn window(allow_window: bool) -> PolicyRule {
    rule(
        "window",
        Rule::DeploymentWindow {
            rrule: "FREQ=DAILY;BYHOUR=9".into(),
            dtstart: None,
            duration_minutes: 60,
            timezone: "UTC".into(),
            allow_window,
        },
    )
}

#[test]
fn short_interval_window_far_from_its_anchor_stays_cheap() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    let scope = fx.scope(&target, &version);
    let every_ten_minutes = rule(
        "window",
        Rule::DeploymentWindow {
            rrule: "FREQ=MINUTELY;INTERVAL=10".into(),
            dtstart: None,
            duration_minutes: 5,
            timezone: "UTC".into(),
            allow_window: true,
        },
    );
    let far = Utc.with_ymd_and_hms(2090, 6, 1, 12, 0, 0).unwrap();

    fx.clock.set(far + Duration::minutes(3));
    let started = std::time::Instant::now();
    let inside = evaluate(&factory, &every_ten_minutes, &scope);
    assert!(started.elapsed() < std::time::Duration::from_secs(1));
    assert!(inside.allowed);
    assert_eq!(
        inside.details.get("windowStart"),
        Some(&serde_json::json!(far.to_rfc3339()))
    );

    fx.clock.set(far + Duration::minutes(7));
    let outside = evaluate(&factory, &every_ten_minutes, &scope);
    assert!(!outside.allowed);
    assert_eq!(outside.next_evaluation_time, Some(far + Duration::minutes(10)));
}

#[test]
fn allow_window_admits_inside_and_schedules_next_start() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    let scope = fx.scope(&target, &version);

    fx.clock.set(t0() + Duration::minutes(9 * 60 + 30));
    assert!(evaluate(&factory, &window(true), &scope).allowed);

    fx.clock.set(t0() + Duration::hours(11));
    let eval = evaluate(&factory, &window(true), &scope);
    assert!(!eval.allowed);
    assert_eq!(
        eval.next_evaluation_time,
        Some(t0() + Duration::days(1) + Duration::hours(9))
    );
}

#[test]
fn blackout_window_denies_until_window_end() {
    let (fx, target, version) = Fixture::simple();
    let factory = fx.factory(vec![]);
    let scope = fx.scope(&target, &version);

    fx.clock.set(t0() + Duration::minutes(9 * 60 + 30));
    let eval = evaluate(&factory, &window(false), &scope);
    assert!(!eval.allowed);
    assert_eq!(eval.next_evaluation_time, Some(t0() + Duration::hours(10)));

    fx.clock.set(t0() + Duration::hours(10));
    assert!(evaluate(&factory, &window(false), &scope).allowed);
}

// ── Environment progression ───────────────────────────────────────

#[test]
fn progression_requires_soak_in_upstream_environment() {
    let (fx, target, version) = Fixture::simple();
    fx.environment("staging");
    let staging = fx.target("d", "staging", "r1");
    let progression = rule(
        "promote",
        Rule::EnvironmentProgression {
            depends_on_environment: Condition::name_equals("staging"),
            minimum_soak_time_minutes: Some(30),
            maximum_age_hours: None,
            minimum_success_percentage: Some(50.0),
            success_statuses: vec![JobStatus::Successful],
        },
    );
    let factory = fx.factory(vec![]);
    let scope = fx.scope(&target, &version);
    fx.clock.set(secs(600));

    let eval = evaluate(&factory, &progression, &scope);
    assert!(!eval.allowed);
    assert_eq!(eval.next_evaluation_time, None);

    let release = fx.release(&staging, "v1", secs(0));
    fx.job("j1", &release, JobStatus::Successful, secs(300));
    let eval = evaluate(&factory, &progression, &scope);
    assert!(!eval.allowed);
    assert_eq!(eval.next_evaluation_time, Some(secs(300 + 30 * 60)));

    fx.clock.set(secs(300 + 30 * 60));
    assert!(evaluate(&factory, &progression, &scope).allowed);
}

// ── Gradual rollout ───────────────────────────────────────────────

#[test]
fn linear_rollout_admits_one_target_per_interval() {
    let fx = Fixture::new();
    fx.deployment("d");
    fx.environment("prod");
    for r in ["r1", "r2", "r3"] {
        fx.resource(r);
    }
    let version = fx.version("v1", "d", t0());
    let targets: Vec<ReleaseTarget> = ["r1", "r2", "r3"]
        .iter()
        .map(|r| fx.target("d", "prod", r))
        .collect();
    let rollout = rule(
        "rollout",
        Rule::GradualRollout {
            rollout_type: RolloutType::Linear,
            time_scale_interval: 60,
        },
    );
    let factory = fx.factory(vec![]);

    let evals: Vec<RuleEvaluation> = targets
        .iter()
        .map(|t| evaluate(&factory, &rollout, &fx.scope(t, &version)))
        .collect();
    assert_eq!(evals.iter().filter(|e| e.allowed).count(), 1);
    let mut pending: Vec<DateTime<Utc>> = evals
        .iter()
        .filter_map(|e| e.next_evaluation_time)
        .collect();
    pending.sort();
    assert_eq!(pending, vec![secs(60), secs(120)]);

    fx.clock.set(secs(120));
    assert!(
        targets
            .iter()
            .all(|t| evaluate(&factory, &rollout, &fx.scope(t, &version)).allowed)
    );
}

#[test]
fn rollout_offsets_beyond_the_calendar_fail_the_rule() {
    let fx = Fixture::new();
    fx.deployment("d");
    fx.environment("prod");
    fx.resource("r1");
    fx.resource("r2");
    let version = fx.version("v1", "d", t0());
    let targets = [fx.target("d", "prod", "r1"), fx.target("d", "prod", "r2")];
    let rollout = rule(
        "rollout",
        Rule::GradualRollout {
            rollout_type: RolloutType::Linear,
            time_scale_interval: u64::MAX,
        },
    );
    let evaluator = fx.factory(vec![]).build(&rollout);

    let results: Vec<_> = targets
        .iter()
        .map(|t| evaluator.evaluate(&fx.scope(t, &version)))
        .collect();
    assert_eq!(results.iter().filter(|r| matches!(r, Ok(e) if e.allowed)).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(PolicyError::Evaluation { .. })))
            .count(),
        1
    );
}

// ── Pipeline ──────────────────────────────────────────────────────

#[test]
fn pipeline_runs_cheapest_first_and_short_circuits() {
    let (fx, target, version) = Fixture::simple();
    let gates = policy(vec![
        rule("approve", Rule::AnyApproval { min_approvals: 1 }),
        rule(
            "beta-only",
            Rule::VersionSelector {
                selector: Condition::metadata_equals("channel", "beta"),
            },
        ),
    ]);
    let factory = fx.factory(vec![gates.clone()]);
    let pipeline = Pipeline::build(&[gates], &factory);
    assert_eq!(pipeline.rule_ids(), vec!["beta-only", "approve"]);

    let decision = pipeline.evaluate(&fx.scope(&target, &version));
    assert!(!decision.allowed);
    assert!(decision.short_circuited);
    assert_eq!(decision.outcomes.len(), 1);
    assert_eq!(decision.outcomes[0].rule_id, "beta-only");
}

#[test]
fn pipeline_skips_dispatch_rules_and_disabled_policies() {
    let (fx, target, version) = Fixture::simple();
    let mut disabled = policy(vec![rule("approve", Rule::AnyApproval { min_approvals: 5 })]);
    disabled.enabled = false;
    let dispatch_only = policy(vec![rule(
        "rollback",
        Rule::Rollback {
            on_job_statuses: vec![JobStatus::Failure],
            on_verification_failure: false,
        },
    )]);
    let factory = fx.factory(vec![]);
    let pipeline = Pipeline::build(&[disabled, dispatch_only], &factory);
    assert!(pipeline.is_empty());

    let decision = pipeline.evaluate(&fx.scope(&target, &version));
    assert!(decision.allowed);
    assert!(decision.outcomes.is_empty());
}

#[test]
fn evaluator_errors_become_denials_without_retry_time() {
    let (fx, target, version) = Fixture::simple();
    let broken = policy(vec![rule(
        "broken",
        Rule::DeploymentWindow {
            rrule: "FREQ=SOMETIMES".into(),
            dtstart: None,
            duration_minutes: 60,
            timezone: "UTC".into(),
            allow_window: true,
        },
    )]);
    let factory = fx.factory(vec![]);
    let decision = Pipeline::build(&[broken], &factory).evaluate(&fx.scope(&target, &version));
    assert!(!decision.allowed);
    assert_eq!(decision.next_evaluation_time, None);
    assert!(decision.outcomes[0].details.contains_key("error"));
}

#[test]
fn pipeline_reports_next_time_of_denial() {
    let (fx, target, version) = Fixture::simple();
    fx.release(&target, "v0", secs(100));
    fx.clock.set(secs(500));
    let gates = policy(vec![rule("cool", Rule::VersionCooldown { interval_seconds: 3600 })]);
    let factory = fx.factory(vec![]);
    let decision = Pipeline::build(&[gates], &factory).evaluate(&fx.scope(&target, &version));
    assert!(!decision.allowed);
    assert!(!decision.short_circuited);
    assert_eq!(decision.next_evaluation_time, Some(secs(3700)));
}

// ── Dispatch gate ─────────────────────────────────────────────────

#[test]
fn retry_backoff_and_rollback_gate_dispatch() {
    let (fx, target, version) = Fixture::simple();
    let release = fx.release(&target, "v1", secs(0));
    fx.job("j1", &release, JobStatus::Failure, secs(100));
    fx.clock.set(secs(110));

    let retry = policy(vec![rule(
        "retry",
        Rule::Retry {
            max_retries: 2,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_seconds: 60,
            max_backoff_seconds: None,
            retry_on_statuses: vec![],
        },
    )]);
    let gate = DispatchGate::new(fx.factory(vec![retry.clone()]));
    let scope = fx.scope(&target, &version);

    let decision = gate.evaluate(&scope);
    assert!(!decision.may_dispatch);
    assert!(!decision.rollback_required);
    assert_eq!(decision.next_retry_at, Some(secs(160)));

    fx.clock.set(secs(160));
    assert!(gate.evaluate(&scope).may_dispatch);

    fx.job("j2", &release, JobStatus::Failure, secs(200));
    fx.job("j3", &release, JobStatus::Failure, secs(300));
    fx.clock.set(secs(10_000));
    let exhausted = gate.evaluate(&scope);
    assert!(!exhausted.may_dispatch);
    assert_eq!(exhausted.next_retry_at, None);

    let rollback = policy(vec![rule(
        "rollback",
        Rule::Rollback {
            on_job_statuses: vec![JobStatus::Failure],
            on_verification_failure: true,
        },
    )]);
    let gate = DispatchGate::new(fx.factory(vec![rollback]));
    let decision = gate.evaluate(&scope);
    assert!(decision.rollback_required);
    assert!(!decision.may_dispatch);
}

#[test]
fn verification_pending_until_job_reports() {
    let (fx, target, version) = Fixture::simple();
    let release = fx.release(&target, "v1", secs(0));
    let verification = policy(vec![rule(
        "verify",
        Rule::Verification {
            metrics: vec![],
            trigger_on: VerificationTrigger::JobSuccess,
        },
    )]);
    let gate = DispatchGate::new(fx.factory(vec![verification]));
    let scope = fx.scope(&target, &version);

    fx.job("j1", &release, JobStatus::Successful, secs(10));
    assert!(gate.evaluate(&scope).verification_pending);

    fx.upsert(Entity::Job(Job {
        id: "j1".into(),
        release_id: release.id.clone(),
        status: JobStatus::Successful,
        created_at: secs(10),
        updated_at: None,
        completed_at: Some(secs(10)),
        message: None,
        verification: Some(VerificationStatus::Passed),
    }));
    let decision = gate.evaluate(&scope);
    assert!(!decision.verification_pending);
    assert!(decision.may_dispatch);
}
