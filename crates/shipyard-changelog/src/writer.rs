//! Appends entity mutations to the changelog.

use std::sync::Arc;

use shipyard_collections::fnv1a_32;
use shipyard_core::{ChangeKind, ChangeSet, Entity, EntityKind, SharedClock};
use tracing::debug;

use crate::error::{ChangelogError, ChangelogResult};
use crate::key::ChangelogKey;
use crate::log::ChangelogLog;

/// Partition a workspace's records land in.
pub fn partition_for(workspace_id: &str, partitions: u32) -> u32 {
    fnv1a_32(workspace_id) % partitions.max(1)
}

#[derive(Clone)]
pub struct ChangelogWriter {
    log: Arc<dyn ChangelogLog>,
    clock: SharedClock,
}

impl ChangelogWriter {
    pub fn new(log: Arc<dyn ChangelogLog>, clock: SharedClock) -> Self {
        Self { log, clock }
    }

    pub fn partition_for(&self, workspace_id: &str) -> u32 {
        partition_for(workspace_id, self.log.partitions())
    }

    /// Append the serialized entity under its compaction key.
    pub fn set(&self, workspace_id: &str, entity: &Entity) -> ChangelogResult<u64> {
        let key = ChangelogKey::for_entity(workspace_id, entity).to_string();
        let value =
            serde_json::to_vec(entity).map_err(|e| ChangelogError::Serialize(e.to_string()))?;
        let partition = self.partition_for(workspace_id);
        let offset = self
            .log
            .append(partition, &key, Some(&value), self.clock.now())?;
        debug!(%key, partition, offset, "changelog set");
        Ok(offset)
    }

    /// Append a tombstone for `key`.
    pub fn delete(&self, workspace_id: &str, key: &str) -> ChangelogResult<u64> {
        let parsed = ChangelogKey::parse(key)?;
        if parsed.workspace_id != workspace_id {
            return Err(ChangelogError::MalformedKey(format!(
                "{key} does not belong to workspace {workspace_id}"
            )));
        }
        let partition = self.partition_for(workspace_id);
        let offset = self.log.append(partition, key, None, self.clock.now())?;
        debug!(%key, partition, offset, "changelog tombstone");
        Ok(offset)
    }

    pub fn delete_entity(
        &self,
        workspace_id: &str,
        kind: EntityKind,
        entity_id: &str,
    ) -> ChangelogResult<u64> {
        let key = ChangelogKey::new(workspace_id, kind, entity_id).to_string();
        self.delete(workspace_id, &key)
    }

    /// Persist every data change of a change set; taints are not logged.
    /// Returns the number of records appended.
    #[tracing::instrument(name = "Changelog.Write", skip_all, fields(workspace = %workspace_id, changes = changes.len()))]
    pub fn write_changeset(&self, workspace_id: &str, changes: &ChangeSet) -> ChangelogResult<usize> {
        let mut written = 0;
        for change in changes.iter() {
            match change.kind {
                ChangeKind::Create | ChangeKind::Update => {
                    self.set(workspace_id, &change.entity)?;
                }
                ChangeKind::Delete => {
                    let (kind, id) = change.key();
                    self.delete_entity(workspace_id, kind, &id)?;
                }
                ChangeKind::Taint => continue,
            }
            written += 1;
        }
        Ok(written)
    }
}
