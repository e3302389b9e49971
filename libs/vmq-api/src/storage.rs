use std::sync::Arc;

use crate::error::StoreError;
use crate::record::{Record, TopicPartition};

/// Append-only log of one topic partition.
///
/// The engine serialises all calls for a partition behind its own lock, so
/// implementations need no internal synchronisation.
pub trait PartitionLog: Send {
    /// Append `record` at `record.offset` and make it durable.
    ///
    /// Returns the offset the backend actually stored the record at; the
    /// engine treats any disagreement with `record.offset` as corruption.
    fn append(&mut self, record: &Record) -> Result<u64, StoreError>;

    /// Up to `max` records starting at `from`, in offset order.
    /// Offsets outside `[earliest_offset, next_offset)` yield fewer records.
    fn read(&self, from: u64, max: usize) -> Result<Vec<Record>, StoreError>;

    /// Lowest offset still stored.
    fn earliest_offset(&self) -> u64;

    /// Offset the next append will receive (the high-water mark).
    fn next_offset(&self) -> u64;

    /// Drop records strictly below `offset`.
    ///
    /// Returns the new earliest offset. Backends that drop whole segments may
    /// keep some records below `offset`, never records at or above it.
    fn truncate_before(&mut self, offset: u64) -> Result<u64, StoreError>;

    fn flush(&mut self) -> Result<(), StoreError>;
}

/// Committed cursor of one group on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    pub group: String,
    pub tp: TopicPartition,
    pub offset: u64,
}

/// Durable namespace `(group, topic, partition) -> committed offset`.
pub trait CursorStore: Send + Sync {
    /// Persist a committed offset. Durable when this returns `Ok`.
    fn commit(&self, group: &str, tp: &TopicPartition, offset: u64) -> Result<(), StoreError>;

    /// Latest committed offset for every known `(group, partition)`.
    fn load(&self) -> Result<Vec<CommittedOffset>, StoreError>;

    fn flush(&self) -> Result<(), StoreError>;
}

/// A storage medium: hands out partition logs and the cursor store.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open (or create) the log of one partition.
    fn open_partition(&self, tp: &TopicPartition) -> Result<Box<dyn PartitionLog>, StoreError>;

    fn cursor_store(&self) -> Arc<dyn CursorStore>;

    /// Topics that already have persisted partitions, with their partition count.
    fn discover(&self) -> Result<Vec<(String, u32)>, StoreError>;
}

/// Builds a backend from its JSON configuration (`"{}"` means defaults).
pub trait StorageFactory {
    fn create(&self, config_json: &str) -> Result<Arc<dyn StorageBackend>, StoreError>;
}
