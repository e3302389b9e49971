use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use vmq_api::{
    CommittedOffset, CursorStore, PartitionLog, Record, StorageBackend, StorageFactory, StoreError,
    TopicPartition,
};

// ═══════════════════════════════════════════════════════════════
//  MemoryStorageConfig
// ═══════════════════════════════════════════════════════════════

fn default_max_records() -> usize {
    1_000_000
}

#[derive(Debug, serde::Deserialize)]
pub struct MemoryStorageConfig {
    /// Per-partition capacity. Appends beyond it fail with an unavailable store.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryPartition
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct PartitionData {
    /// Offset of `records[0]`.
    base: u64,
    records: VecDeque<Record>,
}

impl PartitionData {
    fn next_offset(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

/// Handle to a partition kept in process memory.
///
/// Data lives in the backend, so reopening the same partition from the same
/// backend sees everything appended before.
pub struct MemoryPartition {
    data: Arc<Mutex<PartitionData>>,
    max_records: usize,
}

impl PartitionLog for MemoryPartition {
    fn append(&mut self, record: &Record) -> Result<u64, StoreError> {
        let mut data = self.data.lock();
        if data.records.len() >= self.max_records {
            return Err(StoreError::unavailable(format!(
                "partition full ({} records)",
                self.max_records
            )));
        }
        let offset = data.next_offset();
        let mut stored = record.clone();
        stored.offset = offset;
        data.records.push_back(stored);
        Ok(offset)
    }

    fn read(&self, from: u64, max: usize) -> Result<Vec<Record>, StoreError> {
        let data = self.data.lock();
        let start = from.max(data.base);
        if start >= data.next_offset() {
            return Ok(Vec::new());
        }
        let skip = (start - data.base) as usize;
        Ok(data.records.iter().skip(skip).take(max).cloned().collect())
    }

    fn earliest_offset(&self) -> u64 {
        self.data.lock().base
    }

    fn next_offset(&self) -> u64 {
        self.data.lock().next_offset()
    }

    fn truncate_before(&mut self, offset: u64) -> Result<u64, StoreError> {
        let mut data = self.data.lock();
        let target = offset.min(data.next_offset());
        while data.base < target {
            data.records.pop_front();
            data.base += 1;
        }
        Ok(data.base)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryCursorStore
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    committed: Mutex<BTreeMap<(String, TopicPartition), u64>>,
}

impl CursorStore for MemoryCursorStore {
    fn commit(&self, group: &str, tp: &TopicPartition, offset: u64) -> Result<(), StoreError> {
        self.committed
            .lock()
            .insert((group.to_string(), tp.clone()), offset);
        Ok(())
    }

    fn load(&self) -> Result<Vec<CommittedOffset>, StoreError> {
        Ok(self
            .committed
            .lock()
            .iter()
            .map(|((group, tp), offset)| CommittedOffset {
                group: group.clone(),
                tp: tp.clone(),
                offset: *offset,
            })
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStorage
// ═══════════════════════════════════════════════════════════════

/// Volatile backend. Nothing survives the process, but everything survives a
/// broker being rebuilt on top of the same `MemoryStorage`.
pub struct MemoryStorage {
    partitions: Mutex<HashMap<TopicPartition, Arc<Mutex<PartitionData>>>>,
    cursors: Arc<MemoryCursorStore>,
    max_records: usize,
}

impl MemoryStorage {
    pub fn new(max_records: usize) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            cursors: Arc::new(MemoryCursorStore::default()),
            max_records,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(default_max_records())
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_partition(&self, tp: &TopicPartition) -> Result<Box<dyn PartitionLog>, StoreError> {
        let data = self
            .partitions
            .lock()
            .entry(tp.clone())
            .or_default()
            .clone();
        Ok(Box::new(MemoryPartition {
            data,
            max_records: self.max_records,
        }))
    }

    fn cursor_store(&self) -> Arc<dyn CursorStore> {
        self.cursors.clone()
    }

    fn discover(&self) -> Result<Vec<(String, u32)>, StoreError> {
        let mut topics: BTreeMap<String, u32> = BTreeMap::new();
        for tp in self.partitions.lock().keys() {
            let count = topics.entry(tp.topic.clone()).or_default();
            *count = (*count).max(tp.partition + 1);
        }
        Ok(topics.into_iter().collect())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStorageFactory
// ═══════════════════════════════════════════════════════════════

pub struct MemoryStorageFactory;

impl StorageFactory for MemoryStorageFactory {
    fn create(&self, config_json: &str) -> Result<Arc<dyn StorageBackend>, StoreError> {
        let config: MemoryStorageConfig = if config_json == "{}" {
            MemoryStorageConfig::default()
        } else {
            serde_json::from_str(config_json)?
        };
        Ok(Arc::new(MemoryStorage::new(config.max_records)))
    }
}
