use crate::record::TopicPartition;

/// Metrics sink. Fire-and-forget: implementations must not block.
///
/// Every method has a no-op default so a sink only overrides what it exports.
pub trait Metrics: Send + Sync {
    fn record_append(&self, _tp: &TopicPartition, _offset: u64) {}

    /// `attempt` is 1 for a first delivery, higher for redeliveries.
    fn record_delivery(&self, _group: &str, _tp: &TopicPartition, _attempt: u32) {}

    fn record_ack(&self, _group: &str, _tp: &TopicPartition, _committed: Option<u64>) {}

    fn record_nack(&self, _group: &str, _tp: &TopicPartition) {}

    fn record_lease_expired(&self, _group: &str, _tp: &TopicPartition, _offset: u64) {}

    fn record_dead_letter(&self, _group: &str, _tp: &TopicPartition, _offset: u64) {}

    fn record_rebalance(&self, _group: &str, _generation: u64) {}

    fn record_session(&self, _opened: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
