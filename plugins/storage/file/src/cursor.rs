use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use vmq_api::{CommittedOffset, CursorStore, StoreError, TopicPartition};

use crate::frame::{ByteReader, FRAME_HEADER_BYTES, FrameRead, encode_frame, put_bytes, read_frame};

type CursorKey = (String, TopicPartition);

struct WalState {
    file: File,
    committed: BTreeMap<CursorKey, u64>,
    /// Entries in the file, superseded ones included.
    entries: usize,
    len: u64,
}

/// Write-ahead log of committed offsets, replayed on open.
///
/// Every commit is appended and fsynced before `commit` returns. When the
/// file holds `compact_after` more entries than live cursors it is rewritten
/// with one entry per cursor.
pub struct FileCursorStore {
    path: PathBuf,
    compact_after: usize,
    state: Mutex<WalState>,
}

impl FileCursorStore {
    pub fn open(path: &Path, compact_after: usize) -> Result<Self, StoreError> {
        let (committed, entries, len) = replay(path)?;
        let file = open_append(path)?;
        tracing::debug!(path = %path.display(), cursors = committed.len(), entries, "replayed cursor log");
        Ok(Self {
            path: path.to_path_buf(),
            compact_after,
            state: Mutex::new(WalState {
                file,
                committed,
                entries,
                len,
            }),
        })
    }

    fn compact(&self, state: &mut WalState) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut out = File::create(&tmp).map_err(|e| io_err("create", &tmp, e))?;
        let mut len = 0_u64;
        for ((group, tp), offset) in &state.committed {
            let frame = encode_frame(&encode_entry(group, tp, *offset));
            out.write_all(&frame).map_err(|e| io_err("write", &tmp, e))?;
            len += frame.len() as u64;
        }
        out.sync_all().map_err(|e| io_err("sync_all", &tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err("rename", &self.path, e))?;

        state.file = open_append(&self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            before = state.entries,
            after = state.committed.len(),
            "compacted cursor log"
        );
        state.entries = state.committed.len();
        state.len = len;
        Ok(())
    }
}

impl CursorStore for FileCursorStore {
    fn commit(&self, group: &str, tp: &TopicPartition, offset: u64) -> Result<(), StoreError> {
        let frame = encode_frame(&encode_entry(group, tp, offset));
        let mut state = self.state.lock();
        let written = state.file.write_all(&frame).and_then(|()| state.file.sync_data());
        if let Err(e) = written {
            if let Err(undo) = state.file.set_len(state.len) {
                tracing::error!(path = %self.path.display(), error = %undo, "failed to undo partial commit");
            }
            return Err(io_err("append", &self.path, e));
        }
        state.len += frame.len() as u64;
        state.committed.insert((group.to_string(), tp.clone()), offset);
        state.entries += 1;

        if state.entries >= state.committed.len() + self.compact_after {
            // The commit itself is already durable; a failed rewrite only
            // leaves the log longer than needed.
            if let Err(e) = self.compact(&mut state) {
                tracing::warn!(path = %self.path.display(), error = %e, "cursor log compaction failed");
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<CommittedOffset>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .committed
            .iter()
            .map(|((group, tp), offset)| CommittedOffset {
                group: group.clone(),
                tp: tp.clone(),
                offset: *offset,
            })
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.state
            .lock()
            .file
            .sync_all()
            .map_err(|e| io_err("sync_all", &self.path, e))
    }
}

// ════════════════════════════════════════════════════════════════
//  Entry encoding
// ════════════════════════════════════════════════════════════════

fn encode_entry(group: &str, tp: &TopicPartition, offset: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + group.len() + tp.topic.len());
    put_bytes(&mut buf, group.as_bytes());
    put_bytes(&mut buf, tp.topic.as_bytes());
    buf.extend_from_slice(&tp.partition.to_be_bytes());
    buf.extend_from_slice(&offset.to_be_bytes());
    buf
}

fn decode_entry(payload: &[u8]) -> Result<(CursorKey, u64), StoreError> {
    let mut r = ByteReader { buf: payload, pos: 0 };
    let group = r.string()?;
    let topic = r.string()?;
    let partition = r.u32()?;
    let offset = r.u64()?;
    Ok(((group, TopicPartition::new(topic, partition)), offset))
}

fn replay(path: &Path) -> Result<(BTreeMap<CursorKey, u64>, usize, u64), StoreError> {
    let mut committed = BTreeMap::new();
    let mut entries = 0;
    if !path.exists() {
        return Ok((committed, entries, 0));
    }

    let file = File::open(path).map_err(|e| io_err("open", path, e))?;
    let mut reader = BufReader::new(file);
    let mut valid_len = 0_u64;
    loop {
        match read_frame(&mut reader).map_err(|e| io_err("read", path, e))? {
            FrameRead::Frame(payload) => {
                let (key, offset) = decode_entry(&payload).map_err(|e| e.with_context(path.display()))?;
                committed.insert(key, offset);
                entries += 1;
                valid_len += FRAME_HEADER_BYTES + payload.len() as u64;
            }
            FrameRead::End => break,
            FrameRead::Torn => {
                tracing::warn!(path = %path.display(), position = valid_len, "truncating torn cursor log tail");
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| io_err("open", path, e))?;
                file.set_len(valid_len).map_err(|e| io_err("set_len", path, e))?;
                file.sync_all().map_err(|e| io_err("sync_all", path, e))?;
                break;
            }
        }
    }
    Ok((committed, entries, valid_len))
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err("open", path, e))
}

fn io_err(operation: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::io(format!("{operation} {}: {e}", path.display()))
}
