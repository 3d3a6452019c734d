//! Replays the changelog into the latest value per key.

use std::collections::BTreeMap;
use std::sync::Arc;

use shipyard_core::Entity;
use tracing::debug;

use crate::error::{ChangelogError, ChangelogResult};
use crate::key::ChangelogKey;
use crate::log::ChangelogLog;
use crate::writer::partition_for;

#[derive(Clone)]
pub struct ChangelogReader {
    log: Arc<dyn ChangelogLog>,
}

impl ChangelogReader {
    pub fn new(log: Arc<dyn ChangelogLog>) -> Self {
        Self { log }
    }

    /// Replay `partitions` (all when `None`) in offset order. Tombstoned
    /// keys are dropped; the latest value wins otherwise.
    #[tracing::instrument(name = "Changelog.Load", skip_all)]
    pub fn load(&self, partitions: Option<&[u32]>) -> ChangelogResult<BTreeMap<String, Entity>> {
        let selected: Vec<u32> = match partitions {
            Some(list) => list.to_vec(),
            None => (0..self.log.partitions()).collect(),
        };
        self.replay(&selected, |_| true)
    }

    /// Replay only the records of one workspace.
    #[tracing::instrument(name = "Changelog.LoadForWorkspace", skip_all, fields(workspace = %workspace_id))]
    pub fn load_for_workspace(&self, workspace_id: &str) -> ChangelogResult<BTreeMap<String, Entity>> {
        let prefix = ChangelogKey::workspace_prefix(workspace_id);
        let partition = partition_for(workspace_id, self.log.partitions());
        self.replay(&[partition], |key| key.starts_with(&prefix))
    }

    fn replay(
        &self,
        partitions: &[u32],
        keep: impl Fn(&str) -> bool,
    ) -> ChangelogResult<BTreeMap<String, Entity>> {
        let mut latest: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut records = 0usize;
        for &partition in partitions {
            for record in self.log.read_partition(partition)? {
                if !keep(&record.key) {
                    continue;
                }
                records += 1;
                match record.value {
                    Some(bytes) => {
                        latest.insert(record.key, bytes);
                    }
                    None => {
                        latest.remove(&record.key);
                    }
                }
            }
        }

        let mut entities = BTreeMap::new();
        for (key, bytes) in latest {
            let entity: Entity = serde_json::from_slice(&bytes)
                .map_err(|e| ChangelogError::Deserialize(format!("{key}: {e}")))?;
            entities.insert(key, entity);
        }
        debug!(records, live = entities.len(), "changelog replayed");
        Ok(entities)
    }
}
