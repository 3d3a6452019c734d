//! Replaying the log reproduces the latest state of every key.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use shipyard_changelog::{ChangelogLog, ChangelogReader, ChangelogWriter, MemoryChangelog};
use shipyard_core::{Entity, EntityKind, ManualClock, System};

#[derive(Debug, Clone)]
enum Op {
    Set { workspace: u8, id: u8, name: u8 },
    Delete { workspace: u8, id: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..3, 0u8..6, any::<u8>()).prop_map(|(workspace, id, name)| Op::Set { workspace, id, name }),
        1 => (0u8..3, 0u8..6).prop_map(|(workspace, id)| Op::Delete { workspace, id }),
    ]
}

fn system(workspace: &str, id: u8, name: u8) -> Entity {
    Entity::System(System {
        id: format!("sys-{id}"),
        workspace_id: workspace.to_string(),
        name: format!("n{name}"),
        slug: format!("n{name}"),
    })
}

proptest! {
    #[test]
    fn replay_matches_last_write(ops in prop::collection::vec(op(), 0..80), partitions in 1u32..5) {
        let log: Arc<dyn ChangelogLog> = Arc::new(MemoryChangelog::new(partitions));
        let writer = ChangelogWriter::new(Arc::clone(&log), Arc::new(ManualClock::default()));
        let reader = ChangelogReader::new(log);
        let mut model: BTreeMap<String, Entity> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Set { workspace, id, name } => {
                    let ws = format!("ws{workspace}");
                    let entity = system(&ws, id, name);
                    writer.set(&ws, &entity).unwrap();
                    model.insert(format!("{ws}:system:sys-{id}"), entity);
                }
                Op::Delete { workspace, id } => {
                    let ws = format!("ws{workspace}");
                    writer.delete_entity(&ws, EntityKind::System, &format!("sys-{id}")).unwrap();
                    model.remove(&format!("{ws}:system:sys-{id}"));
                }
            }
        }

        prop_assert_eq!(reader.load(None).unwrap(), model.clone());
        let ws0: BTreeMap<String, Entity> = model
            .into_iter()
            .filter(|(k, _)| k.starts_with("ws0:"))
            .collect();
        prop_assert_eq!(reader.load_for_workspace("ws0").unwrap(), ws0);
    }
}
