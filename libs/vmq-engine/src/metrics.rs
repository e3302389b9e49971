use std::sync::atomic::{AtomicU64, Ordering};

use vmq_api::{Metrics, TopicPartition};

/// In-process counters. Exporting them is someone else's job; the server
/// logs a snapshot on shutdown.
#[derive(Debug, Default)]
pub struct BrokerCounters {
    appended: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    expired: AtomicU64,
    dead_lettered: AtomicU64,
    rebalances: AtomicU64,
    sessions_open: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub appended: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
    pub dead_lettered: u64,
    pub rebalances: u64,
    pub sessions_open: u64,
}

impl BrokerCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            sessions_open: self.sessions_open.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for BrokerCounters {
    fn record_append(&self, _tp: &TopicPartition, _offset: u64) {
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delivery(&self, _group: &str, _tp: &TopicPartition, attempt: u32) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_ack(&self, _group: &str, _tp: &TopicPartition, _committed: Option<u64>) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    fn record_nack(&self, _group: &str, _tp: &TopicPartition) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    fn record_lease_expired(&self, _group: &str, _tp: &TopicPartition, _offset: u64) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dead_letter(&self, _group: &str, _tp: &TopicPartition, _offset: u64) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rebalance(&self, _group: &str, _generation: u64) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    fn record_session(&self, opened: bool) {
        if opened {
            self.sessions_open.fetch_add(1, Ordering::Relaxed);
        } else {
            // Saturate instead of wrapping if close is reported twice.
            let _ = self
                .sessions_open
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }
}
