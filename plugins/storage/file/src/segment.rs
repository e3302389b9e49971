use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use vmq_api::{PartitionLog, Record, StoreError};

use crate::frame::{FRAME_HEADER_BYTES, FrameRead, decode_record, encode_frame, encode_record, read_frame};

const LOG_SUFFIX: &str = ".log";

#[derive(Debug)]
struct Segment {
    base: u64,
    path: PathBuf,
    /// Byte position of every record, `positions[i]` holds offset `base + i`.
    positions: Vec<u64>,
    len: u64,
}

impl Segment {
    fn next_offset(&self) -> u64 {
        self.base + self.positions.len() as u64
    }
}

/// On-disk log of one partition: a directory of `{base_offset:020}.log` files.
///
/// Only the last segment is written to. Positions are rebuilt by scanning on
/// open; a torn or corrupt tail of the last segment is truncated away.
#[derive(Debug)]
pub struct SegmentedLog {
    dir: PathBuf,
    segment_max_bytes: u64,
    sync_on_append: bool,
    segments: Vec<Segment>,
    active: File,
}

impl SegmentedLog {
    pub fn open(dir: &Path, segment_max_bytes: u64, sync_on_append: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| io_err("create_dir_all", dir, e))?;

        let mut bases = collect_bases(dir)?;
        bases.sort_unstable();

        let mut segments: Vec<Segment> = Vec::with_capacity(bases.len().max(1));
        let last = bases.len().saturating_sub(1);
        for (i, base) in bases.into_iter().enumerate() {
            let segment = recover_segment(dir, base, i == last)?;
            if let Some(prev) = segments.last() {
                if prev.next_offset() != segment.base {
                    return Err(StoreError::corrupt(format!(
                        "{}: gap between segments, {} then {}",
                        dir.display(),
                        prev.next_offset(),
                        segment.base
                    )));
                }
            }
            segments.push(segment);
        }
        if segments.is_empty() {
            segments.push(create_segment(dir, 0)?);
        }

        let active = open_append(&segments[segments.len() - 1].path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            segment_max_bytes,
            sync_on_append,
            segments,
            active,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn head(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    fn head_mut(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn roll(&mut self) -> Result<(), StoreError> {
        let base = self.head().next_offset();
        let segment = create_segment(&self.dir, base)?;
        self.active = open_append(&segment.path)?;
        self.segments.push(segment);
        tracing::debug!(dir = %self.dir.display(), base, "rolled segment");
        Ok(())
    }
}

impl PartitionLog for SegmentedLog {
    fn append(&mut self, record: &Record) -> Result<u64, StoreError> {
        if self.head().len >= self.segment_max_bytes && !self.head().positions.is_empty() {
            self.roll()?;
        }

        let offset = self.head().next_offset();
        let mut stored = record.clone();
        stored.offset = offset;
        let frame = encode_frame(&encode_record(&stored));

        let position = self.head().len;
        let path = self.head().path.clone();
        let written = self
            .active
            .write_all(&frame)
            .and_then(|()| if self.sync_on_append { self.active.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            // Drop whatever part of the frame reached the file.
            if let Err(undo) = self.active.set_len(position) {
                tracing::error!(path = %path.display(), error = %undo, "failed to undo partial append");
            }
            return Err(io_err("append", &path, e));
        }

        let head = self.head_mut();
        head.positions.push(position);
        head.len = position + frame.len() as u64;
        Ok(offset)
    }

    fn read(&self, from: u64, max: usize) -> Result<Vec<Record>, StoreError> {
        let mut out = Vec::new();
        if max == 0 || from >= self.next_offset() {
            return Ok(out);
        }
        let from = from.max(self.earliest_offset());
        let first = self.segments.partition_point(|s| s.next_offset() <= from);

        let mut offset = from;
        for segment in &self.segments[first..] {
            if out.len() >= max {
                break;
            }
            let Some(&position) = segment.positions.get((offset - segment.base) as usize) else {
                continue;
            };
            let file = File::open(&segment.path).map_err(|e| io_err("open", &segment.path, e))?;
            let mut reader = BufReader::new(file);
            reader
                .seek(SeekFrom::Start(position))
                .map_err(|e| io_err("seek", &segment.path, e))?;

            while out.len() < max && offset < segment.next_offset() {
                let payload = match read_frame(&mut reader).map_err(|e| io_err("read", &segment.path, e))? {
                    FrameRead::Frame(p) => p,
                    FrameRead::End | FrameRead::Torn => {
                        return Err(StoreError::corrupt(format!(
                            "{}: unreadable frame for offset {offset}",
                            segment.path.display()
                        )));
                    }
                };
                let record = decode_record(&payload)
                    .map_err(|e| e.with_context(segment.path.display()))?;
                if record.offset != offset {
                    return Err(StoreError::corrupt(format!(
                        "{}: found offset {} where {offset} was expected",
                        segment.path.display(),
                        record.offset
                    )));
                }
                out.push(record);
                offset += 1;
            }
        }
        Ok(out)
    }

    fn earliest_offset(&self) -> u64 {
        self.segments[0].base
    }

    fn next_offset(&self) -> u64 {
        self.head().next_offset()
    }

    fn truncate_before(&mut self, offset: u64) -> Result<u64, StoreError> {
        // Whole sealed segments only; the head segment is never removed.
        while self.segments.len() > 1 && self.segments[0].next_offset() <= offset {
            let segment = self.segments.remove(0);
            fs::remove_file(&segment.path).map_err(|e| io_err("remove_file", &segment.path, e))?;
            tracing::debug!(path = %segment.path.display(), "removed segment");
        }
        Ok(self.earliest_offset())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let path = self.head().path.clone();
        self.active.sync_all().map_err(|e| io_err("sync_all", &path, e))
    }
}

// ════════════════════════════════════════════════════════════════
//  Helpers
// ════════════════════════════════════════════════════════════════

fn io_err(operation: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::io(format!("{operation} {}: {e}", path.display()))
}

fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{base:020}{LOG_SUFFIX}"))
}

fn collect_bases(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let mut bases = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err("read_dir", dir, e))? {
        let entry = entry.map_err(|e| io_err("read_dir", dir, e))?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(LOG_SUFFIX)) else {
            continue;
        };
        match stem.parse::<u64>() {
            Ok(base) => bases.push(base),
            Err(_) => tracing::warn!(dir = %dir.display(), file = %stem, "ignoring unrecognised segment file"),
        }
    }
    Ok(bases)
}

fn create_segment(dir: &Path, base: u64) -> Result<Segment, StoreError> {
    let path = segment_path(dir, base);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| io_err("create", &path, e))?;
    Ok(Segment {
        base,
        path,
        positions: Vec::new(),
        len: 0,
    })
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err("open", path, e))
}

/// Scan a segment, rebuilding record positions.
///
/// A bad frame in the head segment is a torn write: the file is truncated
/// there. In a sealed segment it is corruption.
fn recover_segment(dir: &Path, base: u64, is_head: bool) -> Result<Segment, StoreError> {
    let path = segment_path(dir, base);
    let file = File::open(&path).map_err(|e| io_err("open", &path, e))?;
    let mut reader = BufReader::new(file);

    let mut positions = Vec::new();
    let mut position = 0_u64;
    loop {
        let payload = match read_frame(&mut reader).map_err(|e| io_err("read", &path, e))? {
            FrameRead::Frame(p) => p,
            FrameRead::End => break,
            FrameRead::Torn if is_head => {
                tracing::warn!(path = %path.display(), position, "truncating torn tail");
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| io_err("open", &path, e))?;
                file.set_len(position).map_err(|e| io_err("set_len", &path, e))?;
                file.sync_all().map_err(|e| io_err("sync_all", &path, e))?;
                break;
            }
            FrameRead::Torn => {
                return Err(StoreError::corrupt(format!(
                    "{}: bad frame at byte {position} of a sealed segment",
                    path.display()
                )));
            }
        };

        let record = decode_record(&payload).map_err(|e| e.with_context(path.display()))?;
        let expected = base + positions.len() as u64;
        if record.offset != expected {
            return Err(StoreError::corrupt(format!(
                "{}: offset {} where {expected} was expected",
                path.display(),
                record.offset
            )));
        }
        positions.push(position);
        position += FRAME_HEADER_BYTES + payload.len() as u64;
    }

    Ok(Segment {
        base,
        path,
        positions,
        len: position,
    })
}
