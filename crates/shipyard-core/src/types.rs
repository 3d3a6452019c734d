//! Entity types for the Shipyard data model.
//!
//! Every entity is JSON-serializable. Entities referenced by selectors
//! implement [`Selectable`] so conditions can read their columns,
//! metadata and timestamps.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shipyard_selector::{CelExpression, Column, Condition, DateField, Selectable};

use crate::error::{CoreError, CoreResult};
use crate::policy::Policy;

/// Arbitrary structured configuration (`config`, `jobAgentConfig`).
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// String-to-string labels.
pub type Metadata = BTreeMap<String, String>;

// ── Workspace & System ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub slug: String,
}

/// A grouping of deployments and environments; release targets only
/// pair deployments and environments of the same system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub slug: String,
}

// ── Resource ──────────────────────────────────────────────────────

/// Something deployments are rolled out to (a cluster, a VM, a tenant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub identifier: String,
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ── Deployment & versions ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub job_agent_config: ConfigMap,
    /// Resources this deployment applies to. `None` matches every resource.
    #[serde(default)]
    pub resource_selector: Option<Condition>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Building,
    Ready,
    Failed,
    Rejected,
}

/// A candidate artifact of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    pub id: String,
    pub deployment_id: String,
    pub tag: String,
    #[serde(default)]
    pub name: String,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub job_agent_config: ConfigMap,
    #[serde(default)]
    pub metadata: Metadata,
}

// ── Environment ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    /// Resources that belong to this environment. `None` matches nothing.
    #[serde(default)]
    pub resource_selector: Option<Condition>,
    #[serde(default)]
    pub metadata: Metadata,
}

// ── Release targets & releases ────────────────────────────────────

/// The (deployment, environment, resource) triple a desired version is
/// computed for. Derived; never created by external input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    pub deployment_id: String,
    pub environment_id: String,
    pub resource_id: String,
}

impl ReleaseTarget {
    pub fn new(
        deployment_id: impl Into<String>,
        environment_id: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            environment_id: environment_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Composite key `{deployment}:{environment}:{resource}`.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.deployment_id, self.environment_id, self.resource_id
        )
    }

    /// Parse a key produced by [`ReleaseTarget::key`].
    pub fn parse_key(key: &str) -> CoreResult<Self> {
        let mut parts = key.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(e), Some(r)) if !d.is_empty() && !e.is_empty() && !r.is_empty() => {
                Ok(Self::new(d, e, r))
            }
            _ => Err(CoreError::MalformedTargetKey(key.to_string())),
        }
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// An immutable record of a version chosen for a release target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: String,
    pub release_target: ReleaseTarget,
    pub version_id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub encrypted_variables: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Deterministic release id: hex SHA-256 of `{target key}|{version id}`.
    pub fn derive_id(target: &ReleaseTarget, version_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(target.key().as_bytes());
        hasher.update(b"|");
        hasher.update(version_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new(
        target: ReleaseTarget,
        version_id: impl Into<String>,
        variables: BTreeMap<String, serde_json::Value>,
        encrypted_variables: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let version_id = version_id.into();
        Self {
            id: Self::derive_id(&target, &version_id),
            release_target: target,
            version_id,
            variables,
            encrypted_variables,
            created_at,
        }
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    InProgress,
    Successful,
    Failure,
    Cancelled,
    InvalidIntegration,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failure | Self::Cancelled | Self::InvalidIntegration
        )
    }
}

/// Outcome of post-deployment verification attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Running,
    Passed,
    Failed,
}

/// An externally executed unit of work realizing a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub release_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub verification: Option<VerificationStatus>,
}

impl Job {
    /// When the job reached a terminal state; falls back to the last update.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        if !self.status.is_terminal() {
            return None;
        }
        self.completed_at.or(self.updated_at).or(Some(self.created_at))
    }
}

// ── Approvals ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Approved,
    Rejected,
}

/// A user's decision on a version for an environment. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserApprovalRecord {
    pub user_id: String,
    pub version_id: String,
    pub environment_id: String,
    #[serde(default)]
    pub status: ApprovalStatus,
    pub approved_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl UserApprovalRecord {
    /// Composite key `{version}:{environment}:{user}`.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.version_id, self.environment_id, self.user_id)
    }
}

// ── Variables ─────────────────────────────────────────────────────

/// How a variable value is supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VariableValue {
    /// A plain value.
    Literal { value: serde_json::Value },
    /// A value that must only be passed on encrypted.
    Sensitive { value: serde_json::Value },
    /// A value read from a related entity: the relationship rule
    /// `reference` followed by a path into the related entity's JSON.
    Reference {
        reference: String,
        #[serde(default)]
        path: Vec<String>,
    },
}

/// A variable declared on a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariable {
    pub id: String,
    pub deployment_id: String,
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<VariableValue>,
}

/// A candidate value of a deployment variable, scoped by resource selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariableValue {
    pub id: String,
    pub variable_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resource_selector: Option<Condition>,
    pub value: VariableValue,
}

/// A resource-scoped override for a variable key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVariable {
    pub id: String,
    pub resource_id: String,
    pub key: String,
    pub value: VariableValue,
}

// ── Relationships ─────────────────────────────────────────────────

/// Entity kinds a relationship rule can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelatableKind {
    Resource,
    Deployment,
    Environment,
}

/// Declares edges `from -> to` between entities for which `matcher`
/// (a CEL program over `from` and `to`) evaluates true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRule {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Name used by reference variables to follow this relationship.
    pub reference: String,
    pub from_kind: RelatableKind,
    pub to_kind: RelatableKind,
    #[serde(default)]
    pub from_selector: Option<Condition>,
    #[serde(default)]
    pub to_selector: Option<Condition>,
    pub matcher: CelExpression,
}

// ── Entity sum type ───────────────────────────────────────────────

/// Every entity kind the engine stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Workspace,
    System,
    Resource,
    Deployment,
    DeploymentVersion,
    Environment,
    Policy,
    Release,
    Job,
    UserApprovalRecord,
    RelationshipRule,
    DeploymentVariable,
    DeploymentVariableValue,
    ResourceVariable,
}

impl EntityKind {
    pub const ALL: [EntityKind; 14] = [
        Self::Workspace,
        Self::System,
        Self::Resource,
        Self::Deployment,
        Self::DeploymentVersion,
        Self::Environment,
        Self::Policy,
        Self::Release,
        Self::Job,
        Self::UserApprovalRecord,
        Self::RelationshipRule,
        Self::DeploymentVariable,
        Self::DeploymentVariableValue,
        Self::ResourceVariable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::System => "system",
            Self::Resource => "resource",
            Self::Deployment => "deployment",
            Self::DeploymentVersion => "deploymentVersion",
            Self::Environment => "environment",
            Self::Policy => "policy",
            Self::Release => "release",
            Self::Job => "job",
            Self::UserApprovalRecord => "userApprovalRecord",
            Self::RelationshipRule => "relationshipRule",
            Self::DeploymentVariable => "deploymentVariable",
            Self::DeploymentVariableValue => "deploymentVariableValue",
            Self::ResourceVariable => "resourceVariable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored entity of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Entity {
    Workspace(Workspace),
    System(System),
    Resource(Resource),
    Deployment(Deployment),
    DeploymentVersion(DeploymentVersion),
    Environment(Environment),
    Policy(Policy),
    Release(Release),
    Job(Job),
    UserApprovalRecord(UserApprovalRecord),
    RelationshipRule(RelationshipRule),
    DeploymentVariable(DeploymentVariable),
    DeploymentVariableValue(DeploymentVariableValue),
    ResourceVariable(ResourceVariable),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Workspace(_) => EntityKind::Workspace,
            Self::System(_) => EntityKind::System,
            Self::Resource(_) => EntityKind::Resource,
            Self::Deployment(_) => EntityKind::Deployment,
            Self::DeploymentVersion(_) => EntityKind::DeploymentVersion,
            Self::Environment(_) => EntityKind::Environment,
            Self::Policy(_) => EntityKind::Policy,
            Self::Release(_) => EntityKind::Release,
            Self::Job(_) => EntityKind::Job,
            Self::UserApprovalRecord(_) => EntityKind::UserApprovalRecord,
            Self::RelationshipRule(_) => EntityKind::RelationshipRule,
            Self::DeploymentVariable(_) => EntityKind::DeploymentVariable,
            Self::DeploymentVariableValue(_) => EntityKind::DeploymentVariableValue,
            Self::ResourceVariable(_) => EntityKind::ResourceVariable,
        }
    }

    /// The entity's store key.
    pub fn id(&self) -> String {
        match self {
            Self::Workspace(e) => e.id.clone(),
            Self::System(e) => e.id.clone(),
            Self::Resource(e) => e.id.clone(),
            Self::Deployment(e) => e.id.clone(),
            Self::DeploymentVersion(e) => e.id.clone(),
            Self::Environment(e) => e.id.clone(),
            Self::Policy(e) => e.id.clone(),
            Self::Release(e) => e.id.clone(),
            Self::Job(e) => e.id.clone(),
            Self::UserApprovalRecord(e) => e.key(),
            Self::RelationshipRule(e) => e.id.clone(),
            Self::DeploymentVariable(e) => e.id.clone(),
            Self::DeploymentVariableValue(e) => e.id.clone(),
            Self::ResourceVariable(e) => e.id.clone(),
        }
    }

    /// `(entityType, entityId)` used to build changelog keys.
    pub fn compaction_key(&self) -> (EntityKind, String) {
        (self.kind(), self.id())
    }

    /// Reject entities whose selectors or rules are malformed.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::Deployment(d) => validate_optional(d.resource_selector.as_ref()),
            Self::Environment(e) => validate_optional(e.resource_selector.as_ref()),
            Self::Policy(p) => p.validate(),
            Self::DeploymentVariableValue(v) => validate_optional(v.resource_selector.as_ref()),
            Self::RelationshipRule(r) => {
                validate_optional(r.from_selector.as_ref())?;
                validate_optional(r.to_selector.as_ref())?;
                r.matcher.validate()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_optional(selector: Option<&Condition>) -> CoreResult<()> {
    if let Some(condition) = selector {
        condition.validate()?;
    }
    Ok(())
}

// ── Selectable implementations ────────────────────────────────────

impl Selectable for Resource {
    fn cel_name(&self) -> &'static str {
        "resource"
    }

    fn column(&self, column: Column) -> Option<&str> {
        match column {
            Column::Id => Some(&self.id),
            Column::Name => Some(&self.name),
            Column::Version => Some(&self.version),
            Column::Kind => Some(&self.kind),
            Column::Identifier => Some(&self.identifier),
        }
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    fn timestamp(&self, field: DateField) -> Option<DateTime<Utc>> {
        match field {
            DateField::CreatedAt => Some(self.created_at),
            DateField::UpdatedAt => self.updated_at,
        }
    }

    fn to_cel_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Selectable for Deployment {
    fn cel_name(&self) -> &'static str {
        "deployment"
    }

    fn column(&self, column: Column) -> Option<&str> {
        match column {
            Column::Id => Some(&self.id),
            Column::Name => Some(&self.name),
            Column::Identifier => Some(&self.slug),
            Column::Version | Column::Kind => None,
        }
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    fn timestamp(&self, _field: DateField) -> Option<DateTime<Utc>> {
        None
    }

    fn to_cel_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Selectable for Environment {
    fn cel_name(&self) -> &'static str {
        "environment"
    }

    fn column(&self, column: Column) -> Option<&str> {
        match column {
            Column::Id => Some(&self.id),
            Column::Name => Some(&self.name),
            _ => None,
        }
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    fn timestamp(&self, _field: DateField) -> Option<DateTime<Utc>> {
        None
    }

    fn to_cel_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Selectable for DeploymentVersion {
    fn cel_name(&self) -> &'static str {
        "version"
    }

    fn column(&self, column: Column) -> Option<&str> {
        match column {
            Column::Id => Some(&self.id),
            Column::Name => Some(if self.name.is_empty() {
                &self.tag
            } else {
                &self.name
            }),
            Column::Version | Column::Identifier => Some(&self.tag),
            Column::Kind => None,
        }
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    fn timestamp(&self, field: DateField) -> Option<DateTime<Utc>> {
        match field {
            DateField::CreatedAt => Some(self.created_at),
            DateField::UpdatedAt => None,
        }
    }

    fn to_cel_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
