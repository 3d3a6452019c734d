//! redb-backed changelog.
//!
//! Records live in one table keyed by `(partition, offset)`, so a range
//! scan over a partition yields records in offset order. Values are
//! `(key, timestamp millis, payload)` with a `None` payload as tombstone.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{ChangelogError, ChangelogResult};
use crate::log::{ChangelogLog, ChangelogRecord};

/// Convert any `Display` error into a `ChangelogError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| ChangelogError::$variant(e.to_string())
    };
}

const RECORDS: TableDefinition<(u32, u64), (&str, i64, Option<&[u8]>)> =
    TableDefinition::new("changelog_records");

/// Persistent changelog with a fixed partition count.
#[derive(Clone)]
pub struct RedbChangelog {
    db: Arc<Database>,
    partitions: u32,
}

impl RedbChangelog {
    /// Open (or create) a changelog at the given path.
    pub fn open(path: &Path, partitions: u32) -> ChangelogResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let log = Self {
            db: Arc::new(db),
            partitions: partitions.max(1),
        };
        log.ensure_tables()?;
        debug!(?path, partitions, "changelog opened");
        Ok(log)
    }

    /// Create an ephemeral in-memory changelog (for testing).
    pub fn open_in_memory(partitions: u32) -> ChangelogResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let log = Self {
            db: Arc::new(db),
            partitions: partitions.max(1),
        };
        log.ensure_tables()?;
        Ok(log)
    }

    fn ensure_tables(&self) -> ChangelogResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RECORDS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl ChangelogLog for RedbChangelog {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn append(
        &self,
        partition: u32,
        key: &str,
        value: Option<&[u8]>,
        timestamp: DateTime<Utc>,
    ) -> ChangelogResult<u64> {
        self.check_partition(partition)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let offset;
        {
            let mut table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
            let last = table
                .range((partition, 0)..=(partition, u64::MAX))
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value().1);
            offset = last.map_or(0, |o| o + 1);
            table
                .insert((partition, offset), (key, timestamp.timestamp_millis(), value))
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(offset)
    }

    fn read_partition(&self, partition: u32) -> ChangelogResult<Vec<ChangelogRecord>> {
        self.check_partition(partition)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let mut records = Vec::new();
        for entry in table
            .range((partition, 0)..=(partition, u64::MAX))
            .map_err(map_err!(Read))?
        {
            let (k, v) = entry.map_err(map_err!(Read))?;
            let (partition, offset) = k.value();
            let (key, millis, payload) = v.value();
            let timestamp = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ChangelogError::Deserialize(format!("bad timestamp {millis}")))?;
            records.push(ChangelogRecord {
                partition,
                offset,
                key: key.to_string(),
                value: payload.map(<[u8]>::to_vec),
                timestamp,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_in_offset_order() {
        let log = RedbChangelog::open_in_memory(4).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(log.append(2, "ws:system:a", Some(b"{}"), now).unwrap(), 0);
        assert_eq!(log.append(2, "ws:system:a", None, now).unwrap(), 1);
        assert_eq!(log.append(3, "ws:system:b", Some(b"{}"), now).unwrap(), 0);

        let records = log.read_partition(2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value.as_deref(), Some(&b"{}"[..]));
        assert!(records[1].is_tombstone());
        assert_eq!(records[1].timestamp, now);
        assert!(log.read_partition(0).unwrap().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changelog.redb");
        {
            let log = RedbChangelog::open(&path, 2).unwrap();
            log.append(1, "ws:resource:r1", Some(b"x"), Utc::now()).unwrap();
        }
        let log = RedbChangelog::open(&path, 2).unwrap();
        assert_eq!(log.append(1, "ws:resource:r1", None, Utc::now()).unwrap(), 1);
    }
}
