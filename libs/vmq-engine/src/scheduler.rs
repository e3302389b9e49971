use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use vmq_api::{Record, TopicPartition};

use crate::error::BrokerError;
use crate::log::LogStore;
use crate::tracker::PartitionCursor;

const SCAN_BATCH: usize = 16;

// ═══════════════════════════════════════════════════════════════
//  Selection
// ═══════════════════════════════════════════════════════════════

/// What the scheduler found for one cursor.
#[derive(Debug, Default)]
pub struct Selection {
    /// Lowest ready record, if any.
    pub record: Option<Record>,
    /// Delivery times of records parked during the scan.
    pub deferred: Vec<u64>,
}

/// Find the lowest ready offset of a partition for one group.
///
/// Redeliverable offsets always sit below `next_fresh`, so they win over
/// fresh records. Fresh records whose delivery time lies in the future are
/// parked in the cursor and the scan moves past them.
pub fn select(
    cursor: &mut PartitionCursor,
    log: &LogStore,
    tp: &TopicPartition,
    now_ms: u64,
) -> Result<Selection, BrokerError> {
    let mut selection = Selection::default();

    let earliest = log.earliest_offset(tp)?;
    cursor.skip_to(earliest);

    if let Some(offset) = cursor.next_ready() {
        return match log.read_one(tp, offset)? {
            Some(record) => {
                selection.record = Some(record);
                Ok(selection)
            }
            None => Err(log.take_offline(tp, &format!("ready offset {offset} missing from log"))),
        };
    }

    let hwm = log.high_water_mark(tp)?;
    while cursor.next_fresh() < hwm {
        let batch = log.read(tp, cursor.next_fresh(), SCAN_BATCH)?;
        if batch.is_empty() {
            break;
        }
        for record in batch {
            if record.offset != cursor.next_fresh() {
                return Err(log.take_offline(tp, "scan returned an unexpected offset"));
            }
            if record.is_due(now_ms) {
                selection.record = Some(record);
                return Ok(selection);
            }
            let due = record.deliver_at_ms.unwrap_or(now_ms);
            cursor.defer(record.offset, due);
            selection.deferred.push(due);
        }
    }
    Ok(selection)
}

// ═══════════════════════════════════════════════════════════════
//  Timer heap
// ═══════════════════════════════════════════════════════════════

/// Min-heap of `(due, group, partition)`: lease deadlines and delivery times.
///
/// Entries are hints. A popped entry makes the sweeper look at that cursor;
/// if the lease was acked meanwhile there is simply nothing to do.
#[derive(Debug, Default)]
pub struct LeaseTimer {
    heap: BinaryHeap<Reverse<(u64, String, TopicPartition)>>,
}

impl LeaseTimer {
    /// Returns true when the new entry is now the earliest one.
    pub fn push(&mut self, due_ms: u64, group: &str, tp: &TopicPartition) -> bool {
        let earliest = self.next_due().is_none_or(|d| due_ms < d);
        self.heap.push(Reverse((due_ms, group.to_string(), tp.clone())));
        earliest
    }

    pub fn next_due(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Remove every entry due at `now_ms`, collapsing duplicates.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<(String, TopicPartition)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while self.next_due().is_some_and(|d| d <= now_ms) {
            if let Some(Reverse((_, group, tp))) = self.heap.pop() {
                if seen.insert((group.clone(), tp.clone())) {
                    out.push((group, tp));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Waiters
// ═══════════════════════════════════════════════════════════════

type WaiterIndex = HashMap<TopicPartition, HashMap<u64, Arc<Notify>>>;

/// Sessions waiting for work, indexed by partition.
#[derive(Default)]
pub struct WaitSet {
    index: Arc<Mutex<WaiterIndex>>,
    next_id: AtomicU64,
}

impl WaitSet {
    /// Register interest in `tps`. Dropping the handle deregisters it.
    pub fn register(&self, tps: &[TopicPartition]) -> WaitHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        let mut index = self.index.lock();
        for tp in tps {
            index.entry(tp.clone()).or_default().insert(id, notify.clone());
        }
        WaitHandle {
            index: self.index.clone(),
            id,
            keys: tps.to_vec(),
            notify,
        }
    }

    /// Wake every waiter of `tp`. A waiter not currently waiting keeps the
    /// wakeup for its next wait.
    pub fn wake(&self, tp: &TopicPartition) {
        if let Some(waiters) = self.index.lock().get(tp) {
            for notify in waiters.values() {
                notify.notify_one();
            }
        }
    }
}

/// Owned registration in a `WaitSet`.
pub struct WaitHandle {
    index: Arc<Mutex<WaiterIndex>>,
    id: u64,
    keys: Vec<TopicPartition>,
    notify: Arc<Notify>,
}

impl WaitHandle {
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        let mut index = self.index.lock();
        for tp in &self.keys {
            if let Some(waiters) = index.get_mut(tp) {
                waiters.remove(&self.id);
                if waiters.is_empty() {
                    index.remove(tp);
                }
            }
        }
    }
}
