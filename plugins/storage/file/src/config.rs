// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_sync_on_append() -> bool {
    true
}

fn default_compact_after() -> usize {
    4096
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileStorageConfig {
    /// Root directory. Logs go under `topics/`, cursors into `offsets.wal`.
    pub data_dir: String,
    /// A segment is rolled once it grows past this size.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    /// fsync every append before acknowledging it.
    #[serde(default = "default_sync_on_append")]
    pub sync_on_append: bool,
    /// Rewrite the cursor log once it holds this many superseded entries.
    #[serde(default = "default_compact_after")]
    pub compact_after: usize,
}

impl FileStorageConfig {
    pub fn new(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            segment_max_bytes: default_segment_max_bytes(),
            sync_on_append: default_sync_on_append(),
            compact_after: default_compact_after(),
        }
    }
}
