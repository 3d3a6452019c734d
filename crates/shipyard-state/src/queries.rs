//! Read-side queries spanning several repositories.

use std::collections::HashSet;

use shipyard_core::*;

use crate::store::Store;

impl Store {
    // ── Versions ──────────────────────────────────────────────────

    /// Versions of a deployment, newest first (ties broken by id).
    pub fn versions_for_deployment(&self, deployment_id: &str) -> Vec<DeploymentVersion> {
        let mut versions = self
            .versions
            .filter(|v| v.deployment_id == deployment_id);
        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        versions
    }

    /// Ready versions of a deployment, newest first.
    pub fn candidate_versions(&self, deployment_id: &str) -> Vec<DeploymentVersion> {
        self.versions_for_deployment(deployment_id)
            .into_iter()
            .filter(|v| v.status == VersionStatus::Ready)
            .collect()
    }

    // ── Topology ──────────────────────────────────────────────────

    pub fn deployments_in_system(&self, system_id: &str) -> Vec<Deployment> {
        self.deployments.filter(|d| d.system_id == system_id)
    }

    pub fn environments_in_system(&self, system_id: &str) -> Vec<Environment> {
        self.environments.filter(|e| e.system_id == system_id)
    }

    /// Resources that are not soft-deleted.
    pub fn live_resources(&self) -> Vec<Resource> {
        self.resources.filter(|r| !r.is_deleted())
    }

    // ── Release targets ───────────────────────────────────────────

    pub fn targets_for_deployment(&self, deployment_id: &str) -> Vec<ReleaseTarget> {
        self.targets_where(|t| t.deployment_id == deployment_id)
    }

    pub fn targets_for_environment(&self, environment_id: &str) -> Vec<ReleaseTarget> {
        self.targets_where(|t| t.environment_id == environment_id)
    }

    pub fn targets_for_resource(&self, resource_id: &str) -> Vec<ReleaseTarget> {
        self.targets_where(|t| t.resource_id == resource_id)
    }

    pub fn targets_where(&self, mut keep: impl FnMut(&ReleaseTarget) -> bool) -> Vec<ReleaseTarget> {
        let mut targets: Vec<ReleaseTarget> =
            self.release_targets().into_iter().filter(|t| keep(t)).collect();
        targets.sort();
        targets
    }

    // ── Releases & jobs ───────────────────────────────────────────

    /// Releases of a target, newest first.
    pub fn releases_for_target(&self, target: &ReleaseTarget) -> Vec<Release> {
        let mut releases = self.releases.filter(|r| &r.release_target == target);
        releases.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        releases
    }

    pub fn latest_release_for_target(&self, target: &ReleaseTarget) -> Option<Release> {
        self.releases_for_target(target).into_iter().next()
    }

    /// Jobs of every release of a target, newest first.
    pub fn jobs_for_target(&self, target: &ReleaseTarget) -> Vec<Job> {
        let release_ids: HashSet<String> = self
            .releases_for_target(target)
            .into_iter()
            .map(|r| r.id)
            .collect();
        let mut jobs = self.jobs.filter(|j| release_ids.contains(&j.release_id));
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        jobs
    }

    /// The most recently finished job of a target.
    pub fn latest_completed_job(&self, target: &ReleaseTarget) -> Option<Job> {
        self.jobs_for_target(target)
            .into_iter()
            .filter_map(|j| j.finished_at().map(|at| (at, j)))
            .max_by(|(a, ja), (b, jb)| a.cmp(b).then_with(|| ja.id.cmp(&jb.id)))
            .map(|(_, j)| j)
    }

    /// Jobs for releases of `version_id` on targets in `environment_id`,
    /// newest first.
    pub fn jobs_for_version_in_environment(
        &self,
        version_id: &str,
        environment_id: &str,
    ) -> Vec<(Release, Job)> {
        let releases: Vec<Release> = self.releases.filter(|r| {
            r.version_id == version_id && r.release_target.environment_id == environment_id
        });
        let mut pairs = Vec::new();
        for release in releases {
            for job in self.jobs.filter(|j| j.release_id == release.id) {
                pairs.push((release.clone(), job));
            }
        }
        pairs.sort_by(|(_, a), (_, b)| b.created_at.cmp(&a.created_at));
        pairs
    }

    /// Target a job belongs to, via its release.
    pub fn target_for_job(&self, job: &Job) -> Option<ReleaseTarget> {
        self.releases
            .get(&job.release_id)
            .map(|r| r.release_target)
    }

    // ── Approvals ─────────────────────────────────────────────────

    pub fn approvals_for(&self, version_id: &str, environment_id: &str) -> Vec<UserApprovalRecord> {
        let mut records = self
            .approvals
            .filter(|a| a.version_id == version_id && a.environment_id == environment_id);
        records.sort_by(|a, b| a.approved_at.cmp(&b.approved_at));
        records
    }

    // ── Variables ─────────────────────────────────────────────────

    pub fn variables_for_deployment(&self, deployment_id: &str) -> Vec<DeploymentVariable> {
        let mut vars = self
            .deployment_variables
            .filter(|v| v.deployment_id == deployment_id);
        vars.sort_by(|a, b| a.key.cmp(&b.key));
        vars
    }

    /// Values of a deployment variable, highest priority first.
    pub fn values_for_variable(&self, variable_id: &str) -> Vec<DeploymentVariableValue> {
        let mut values = self
            .deployment_variable_values
            .filter(|v| v.variable_id == variable_id);
        values.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        values
    }

    pub fn resource_variable(&self, resource_id: &str, key: &str) -> Option<ResourceVariable> {
        self.resource_variables
            .filter(|v| v.resource_id == resource_id && v.key == key)
            .into_iter()
            .min_by(|a, b| a.id.cmp(&b.id))
    }
}
