//! The partitioned log abstraction and its in-memory backend.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{ChangelogError, ChangelogResult};

/// One appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    /// `None` is a tombstone.
    pub value: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl ChangelogRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A fixed set of append-only partitions.
pub trait ChangelogLog: Send + Sync {
    fn partitions(&self) -> u32;

    /// Append to `partition`, returning the record's offset.
    fn append(
        &self,
        partition: u32,
        key: &str,
        value: Option<&[u8]>,
        timestamp: DateTime<Utc>,
    ) -> ChangelogResult<u64>;

    /// Every record of `partition` in offset order.
    fn read_partition(&self, partition: u32) -> ChangelogResult<Vec<ChangelogRecord>>;

    fn check_partition(&self, partition: u32) -> ChangelogResult<()> {
        let partitions = self.partitions();
        if partition >= partitions {
            return Err(ChangelogError::PartitionOutOfRange {
                partition,
                partitions,
            });
        }
        Ok(())
    }
}

/// Process-local log.
#[derive(Debug)]
pub struct MemoryChangelog {
    partitions: Mutex<Vec<Vec<ChangelogRecord>>>,
}

impl MemoryChangelog {
    pub fn new(partitions: u32) -> Self {
        let count = partitions.max(1) as usize;
        Self {
            partitions: Mutex::new(vec![Vec::new(); count]),
        }
    }

    /// Total records across partitions.
    pub fn len(&self) -> usize {
        self.partitions.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangelogLog for MemoryChangelog {
    fn partitions(&self) -> u32 {
        self.partitions.lock().len() as u32
    }

    fn append(
        &self,
        partition: u32,
        key: &str,
        value: Option<&[u8]>,
        timestamp: DateTime<Utc>,
    ) -> ChangelogResult<u64> {
        self.check_partition(partition)?;
        let mut partitions = self.partitions.lock();
        let log = &mut partitions[partition as usize];
        let offset = log.len() as u64;
        log.push(ChangelogRecord {
            partition,
            offset,
            key: key.to_string(),
            value: value.map(<[u8]>::to_vec),
            timestamp,
        });
        Ok(offset)
    }

    fn read_partition(&self, partition: u32) -> ChangelogResult<Vec<ChangelogRecord>> {
        self.check_partition(partition)?;
        Ok(self.partitions.lock()[partition as usize].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_per_partition() {
        let log = MemoryChangelog::new(2);
        let now = Utc::now();
        assert_eq!(log.append(0, "a", Some(b"1"), now).unwrap(), 0);
        assert_eq!(log.append(1, "b", Some(b"2"), now).unwrap(), 0);
        assert_eq!(log.append(0, "a", None, now).unwrap(), 1);
        let records = log.read_partition(0).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].is_tombstone());
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn rejects_unknown_partition() {
        let log = MemoryChangelog::new(2);
        assert!(matches!(
            log.append(5, "a", None, Utc::now()),
            Err(ChangelogError::PartitionOutOfRange { partition: 5, partitions: 2 })
        ));
    }
}
