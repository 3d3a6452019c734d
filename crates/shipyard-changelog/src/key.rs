//! Changelog record keys.

use std::fmt;

use shipyard_core::{Entity, EntityKind};

use crate::error::{ChangelogError, ChangelogResult};

/// `{workspaceId}:{entityType}:{entityId}`. Entity ids may themselves
/// contain `:`; workspace ids and type names may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangelogKey {
    pub workspace_id: String,
    pub kind: EntityKind,
    pub entity_id: String,
}

impl ChangelogKey {
    pub fn new(workspace_id: impl Into<String>, kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            kind,
            entity_id: entity_id.into(),
        }
    }

    pub fn for_entity(workspace_id: &str, entity: &Entity) -> Self {
        let (kind, id) = entity.compaction_key();
        Self::new(workspace_id, kind, id)
    }

    pub fn parse(raw: &str) -> ChangelogResult<Self> {
        let malformed = || ChangelogError::MalformedKey(raw.to_string());
        let mut parts = raw.splitn(3, ':');
        let workspace_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let kind = parts
            .next()
            .and_then(EntityKind::parse)
            .ok_or_else(malformed)?;
        let entity_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        Ok(Self::new(workspace_id, kind, entity_id))
    }

    /// Prefix shared by every key of a workspace.
    pub fn workspace_prefix(workspace_id: &str) -> String {
        format!("{workspace_id}:")
    }
}

impl fmt::Display for ChangelogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.workspace_id, self.kind, self.entity_id)
    }
}
