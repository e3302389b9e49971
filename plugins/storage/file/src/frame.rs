//! Checksummed frames shared by segment files and the cursor log.
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────┐
//! │ len (4B) │ crc (4B) │ payload (len B) │
//! └──────────┴──────────┴─────────────────┘
//! ```
//!
//! Both header fields are big-endian. `crc` is CRC32 over the payload.

use std::io::{self, Read};

use vmq_api::{Headers, Record, StoreError};

pub(crate) const FRAME_HEADER_BYTES: u64 = 8;
pub(crate) const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

const FLAG_DELIVER_AT: u8 = 0b01;
const FLAG_KEY: u8 = 0b10;

pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + FRAME_HEADER_BYTES as usize);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Outcome of reading one frame from a stream.
pub(crate) enum FrameRead {
    Frame(Vec<u8>),
    /// Clean end of stream.
    End,
    /// Short read, oversized length or checksum mismatch: the tail is unusable.
    Torn,
}

pub(crate) fn read_frame(reader: &mut impl Read) -> io::Result<FrameRead> {
    let mut header = [0_u8; FRAME_HEADER_BYTES as usize];
    match read_full(reader, &mut header)? {
        0 => return Ok(FrameRead::End),
        n if n < header.len() => return Ok(FrameRead::Torn),
        _ => {}
    }
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_BYTES {
        return Ok(FrameRead::Torn);
    }
    let mut payload = vec![0_u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(FrameRead::Torn);
    }
    if crc32fast::hash(&payload) != crc {
        return Ok(FrameRead::Torn);
    }
    Ok(FrameRead::Frame(payload))
}

/// Like `read_exact` but reports how much was read instead of failing on EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ════════════════════════════════════════════════════════════════
//  Record payload
// ════════════════════════════════════════════════════════════════

pub(crate) fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + record.payload.len());
    buf.extend_from_slice(&record.offset.to_be_bytes());
    buf.extend_from_slice(&record.timestamp_ms.to_be_bytes());

    let mut flags = 0_u8;
    if record.deliver_at_ms.is_some() {
        flags |= FLAG_DELIVER_AT;
    }
    if record.key.is_some() {
        flags |= FLAG_KEY;
    }
    buf.push(flags);
    if let Some(at) = record.deliver_at_ms {
        buf.extend_from_slice(&at.to_be_bytes());
    }
    if let Some(key) = &record.key {
        put_bytes(&mut buf, key.as_bytes());
    }

    buf.extend_from_slice(&(record.headers.len() as u32).to_be_bytes());
    for (name, value) in &record.headers {
        put_bytes(&mut buf, name.as_bytes());
        put_bytes(&mut buf, value.as_bytes());
    }
    put_bytes(&mut buf, &record.payload);
    buf
}

pub(crate) fn decode_record(payload: &[u8]) -> Result<Record, StoreError> {
    let mut r = ByteReader { buf: payload, pos: 0 };
    let offset = r.u64()?;
    let timestamp_ms = r.u64()?;
    let flags = r.u8()?;
    let deliver_at_ms = if flags & FLAG_DELIVER_AT != 0 {
        Some(r.u64()?)
    } else {
        None
    };
    let key = if flags & FLAG_KEY != 0 {
        Some(r.string()?)
    } else {
        None
    };
    let header_count = r.u32()?;
    let mut headers = Headers::new();
    for _ in 0..header_count {
        let name = r.string()?;
        let value = r.string()?;
        headers.insert(name, value);
    }
    let body = r.bytes()?.to_vec();
    if r.pos != payload.len() {
        return Err(StoreError::corrupt(format!(
            "{} trailing bytes after record {offset}",
            payload.len() - r.pos
        )));
    }
    Ok(Record {
        offset,
        timestamp_ms,
        deliver_at_ms,
        key,
        headers,
        payload: body,
    })
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

pub(crate) struct ByteReader<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| StoreError::corrupt(format!("truncated field at byte {}", self.pos)))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, StoreError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, StoreError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, StoreError> {
        let b = self.take(8)?;
        let mut arr = [0_u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8], StoreError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<String, StoreError> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec()).map_err(|e| StoreError::corrupt(format!("utf-8: {e}")))
    }
}
