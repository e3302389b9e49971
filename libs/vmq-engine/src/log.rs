use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use vmq_api::{Metrics, NewRecord, PartitionLog, Record, StorageBackend, TopicPartition};

use crate::error::BrokerError;

const READER_BATCH: usize = 64;

// ═══════════════════════════════════════════════════════════════
//  Partition
// ═══════════════════════════════════════════════════════════════

struct PartitionState {
    log: Box<dyn PartitionLog>,
    /// High-water mark: offset of the next append.
    next: u64,
    offline: bool,
}

/// One partition log behind its own lock. Appends on different partitions
/// never contend.
pub struct PartitionHandle {
    tp: TopicPartition,
    state: Mutex<PartitionState>,
}

impl PartitionHandle {
    fn take_offline(&self, state: &mut PartitionState, reason: &str) -> BrokerError {
        if !state.offline {
            state.offline = true;
            tracing::error!(tp = %self.tp, reason, "partition taken offline");
        }
        BrokerError::PartitionOffline(self.tp.clone())
    }

    fn append(&self, record: NewRecord) -> Result<u64, BrokerError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(BrokerError::PartitionOffline(self.tp.clone()));
        }
        let offset = state.next;
        let stored = state
            .log
            .append(&record.at_offset(offset))
            .map_err(|e| BrokerError::from(e).with_context(&self.tp))?;
        if stored != offset {
            let reason = format!("backend stored offset {stored}, expected {offset}");
            return Err(self.take_offline(&mut state, &reason));
        }
        state.next = offset + 1;
        Ok(offset)
    }

    fn read(&self, from: u64, max: usize) -> Result<Vec<Record>, BrokerError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(BrokerError::PartitionOffline(self.tp.clone()));
        }
        let start = from.max(state.log.earliest_offset());
        let records = state
            .log
            .read(start, max)
            .map_err(|e| BrokerError::from(e).with_context(&self.tp))?;
        for (i, record) in records.iter().enumerate() {
            let expected = start + i as u64;
            if record.offset != expected {
                let reason = format!("gap in log: found offset {} where {expected} was expected", record.offset);
                return Err(self.take_offline(&mut state, &reason));
            }
        }
        Ok(records)
    }

    fn bounds(&self) -> Result<(u64, u64), BrokerError> {
        let state = self.state.lock();
        if state.offline {
            return Err(BrokerError::PartitionOffline(self.tp.clone()));
        }
        Ok((state.log.earliest_offset(), state.next))
    }
}

/// Result of a truncation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateOutcome {
    /// Records below `earliest` are gone.
    Truncated { earliest: u64 },
    /// A consumer group still needs records from `floor` on.
    Refused { floor: u64 },
}

// ═══════════════════════════════════════════════════════════════
//  LogStore
// ═══════════════════════════════════════════════════════════════

/// Durable per-partition logs. Single source of truth for which records
/// exist and in what order.
pub struct LogStore {
    backend: Arc<dyn StorageBackend>,
    partitions: RwLock<HashMap<TopicPartition, Arc<PartitionHandle>>>,
    metrics: Arc<dyn Metrics>,
}

impl LogStore {
    pub fn new(backend: Arc<dyn StorageBackend>, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            backend,
            partitions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Open a partition through the backend. Opening twice is a no-op.
    pub fn open(&self, tp: &TopicPartition) -> Result<(), BrokerError> {
        if self.partitions.read().contains_key(tp) {
            return Ok(());
        }
        let mut partitions = self.partitions.write();
        if partitions.contains_key(tp) {
            return Ok(());
        }
        let log = self.backend.open_partition(tp)?;
        let next = log.next_offset();
        tracing::debug!(%tp, earliest = log.earliest_offset(), next, "opened partition");
        partitions.insert(
            tp.clone(),
            Arc::new(PartitionHandle {
                tp: tp.clone(),
                state: Mutex::new(PartitionState {
                    log,
                    next,
                    offline: false,
                }),
            }),
        );
        Ok(())
    }

    fn handle(&self, tp: &TopicPartition) -> Result<Arc<PartitionHandle>, BrokerError> {
        self.partitions
            .read()
            .get(tp)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopic(tp.to_string()))
    }

    /// Append a record and return its offset. Durable on return.
    pub fn append(&self, tp: &TopicPartition, record: NewRecord) -> Result<u64, BrokerError> {
        let offset = self.handle(tp)?.append(record)?;
        self.metrics.record_append(tp, offset);
        tracing::debug!(%tp, offset, "appended");
        Ok(offset)
    }

    /// Up to `max` records from `from` on, in offset order.
    pub fn read(&self, tp: &TopicPartition, from: u64, max: usize) -> Result<Vec<Record>, BrokerError> {
        self.handle(tp)?.read(from, max)
    }

    /// The record at exactly `offset`, if it is stored.
    pub fn read_one(&self, tp: &TopicPartition, offset: u64) -> Result<Option<Record>, BrokerError> {
        Ok(self
            .read(tp, offset, 1)?
            .into_iter()
            .next()
            .filter(|r| r.offset == offset))
    }

    /// Lazy iterator from `from` up to the high-water mark as of now.
    pub fn reader(&self, tp: &TopicPartition, from: u64) -> Result<LogReader, BrokerError> {
        let handle = self.handle(tp)?;
        let (_, end) = handle.bounds()?;
        Ok(LogReader {
            handle,
            next: from,
            end,
            batch: VecDeque::new(),
        })
    }

    pub fn high_water_mark(&self, tp: &TopicPartition) -> Result<u64, BrokerError> {
        Ok(self.handle(tp)?.bounds()?.1)
    }

    pub fn earliest_offset(&self, tp: &TopicPartition) -> Result<u64, BrokerError> {
        Ok(self.handle(tp)?.bounds()?.0)
    }

    /// Remove records strictly below `offset`, unless a consumer still needs
    /// them: `floor` is the lowest offset any group has not yet committed.
    pub fn truncate_before(
        &self,
        tp: &TopicPartition,
        offset: u64,
        floor: Option<u64>,
    ) -> Result<TruncateOutcome, BrokerError> {
        if let Some(floor) = floor.filter(|f| offset > *f) {
            tracing::warn!(%tp, offset, floor, "truncation refused, records still unconsumed");
            return Ok(TruncateOutcome::Refused { floor });
        }
        let handle = self.handle(tp)?;
        let mut state = handle.state.lock();
        if state.offline {
            return Err(BrokerError::PartitionOffline(tp.clone()));
        }
        let bound = offset.min(state.next);
        let earliest = state
            .log
            .truncate_before(bound)
            .map_err(|e| BrokerError::from(e).with_context(tp))?;
        tracing::info!(%tp, requested = offset, earliest, "truncated partition");
        Ok(TruncateOutcome::Truncated { earliest })
    }

    /// Mark a partition unusable after an invariant violation seen elsewhere.
    pub fn take_offline(&self, tp: &TopicPartition, reason: &str) -> BrokerError {
        match self.handle(tp) {
            Ok(handle) => {
                let mut state = handle.state.lock();
                handle.take_offline(&mut state, reason)
            }
            Err(e) => e,
        }
    }

    pub fn is_online(&self, tp: &TopicPartition) -> bool {
        self.handle(tp).is_ok_and(|h| !h.state.lock().offline)
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut tps: Vec<_> = self.partitions.read().keys().cloned().collect();
        tps.sort();
        tps
    }

    /// Flush every partition. Failures are logged; the first one is returned.
    pub fn flush_all(&self) -> Result<(), BrokerError> {
        let handles: Vec<_> = self.partitions.read().values().cloned().collect();
        let mut first_err = None;
        for handle in handles {
            if let Err(e) = handle.state.lock().log.flush() {
                tracing::error!(tp = %handle.tp, error = %e, "flush failed");
                first_err.get_or_insert(BrokerError::from(e).with_context(&handle.tp));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ═══════════════════════════════════════════════════════════════
//  LogReader
// ═══════════════════════════════════════════════════════════════

/// Finite iterator over one partition.
///
/// Bounded by the high-water mark captured when it was created; records
/// appended later are not yielded. Reads in batches, taking the partition
/// lock only for the duration of each batch.
pub struct LogReader {
    handle: Arc<PartitionHandle>,
    next: u64,
    end: u64,
    batch: VecDeque<Record>,
}

impl Iterator for LogReader {
    type Item = Result<Record, BrokerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() {
            if self.next >= self.end {
                return None;
            }
            let max = READER_BATCH.min((self.end - self.next) as usize);
            match self.handle.read(self.next, max) {
                Ok(records) => {
                    let Some(last) = records.last() else {
                        self.next = self.end;
                        return None;
                    };
                    self.next = last.offset + 1;
                    self.batch.extend(records);
                }
                Err(e) => {
                    self.next = self.end;
                    return Some(Err(e));
                }
            }
        }
        self.batch.pop_front().map(Ok)
    }
}
