mod config;
mod cursor;
mod frame;
mod segment;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vmq_api::{
    CursorStore, PartitionLog, StorageBackend, StorageFactory, StoreError, TopicPartition,
};

pub use config::FileStorageConfig;
pub use cursor::FileCursorStore;
pub use segment::SegmentedLog;

const TOPICS_DIR: &str = "topics";
const CURSOR_FILE: &str = "offsets.wal";

// ════════════════════════════════════════════════════════════════
//  FileStorage
// ════════════════════════════════════════════════════════════════

/// Durable backend rooted at `data_dir`:
///
/// ```text
/// data_dir/
///   offsets.wal
///   topics/<topic>/<partition>/<base_offset>.log
/// ```
pub struct FileStorage {
    root: PathBuf,
    config: FileStorageConfig,
    cursors: Arc<FileCursorStore>,
}

impl FileStorage {
    pub fn open(config: FileStorageConfig) -> Result<Self, StoreError> {
        if config.segment_max_bytes == 0 {
            return Err(StoreError::config("segment_max_bytes must be > 0"));
        }
        let root = PathBuf::from(&config.data_dir);
        fs::create_dir_all(root.join(TOPICS_DIR))
            .map_err(|e| StoreError::io(format!("mkdir {}: {e}", root.display())))?;
        let cursors = Arc::new(FileCursorStore::open(
            &root.join(CURSOR_FILE),
            config.compact_after,
        )?);
        tracing::info!(data_dir = %root.display(), "opened file storage");
        Ok(Self {
            root,
            config,
            cursors,
        })
    }

    fn partition_dir(&self, tp: &TopicPartition) -> PathBuf {
        self.root
            .join(TOPICS_DIR)
            .join(&tp.topic)
            .join(tp.partition.to_string())
    }
}

impl StorageBackend for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open_partition(&self, tp: &TopicPartition) -> Result<Box<dyn PartitionLog>, StoreError> {
        let log = SegmentedLog::open(
            &self.partition_dir(tp),
            self.config.segment_max_bytes,
            self.config.sync_on_append,
        )
        .map_err(|e| e.with_context(tp))?;
        Ok(Box::new(log))
    }

    fn cursor_store(&self) -> Arc<dyn CursorStore> {
        self.cursors.clone()
    }

    fn discover(&self) -> Result<Vec<(String, u32)>, StoreError> {
        let topics_dir = self.root.join(TOPICS_DIR);
        let mut found = Vec::new();
        for topic in list_dirs(&topics_dir)? {
            let Some(name) = topic.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let partitions = list_dirs(&topic)?
                .iter()
                .filter_map(|p| p.file_name()?.to_str()?.parse::<u32>().ok())
                .max();
            if let Some(max) = partitions {
                found.push((name.to_string(), max + 1));
            }
        }
        found.sort();
        Ok(found)
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(format!("read_dir {}: {e}", dir.display())))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(format!("read_dir {}: {e}", dir.display())))?;
        if entry.path().is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

// ════════════════════════════════════════════════════════════════
//  FileStorageFactory
// ════════════════════════════════════════════════════════════════

pub struct FileStorageFactory;

impl StorageFactory for FileStorageFactory {
    fn create(&self, config_json: &str) -> Result<Arc<dyn StorageBackend>, StoreError> {
        let config: FileStorageConfig = serde_json::from_str(config_json)
            .map_err(|e| StoreError::config(format!("file storage config: {e}")))?;
        Ok(Arc::new(FileStorage::open(config)?))
    }
}
