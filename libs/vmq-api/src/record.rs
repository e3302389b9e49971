use std::collections::BTreeMap;
use std::fmt;

/// String headers attached to a record. Ordered so the on-disk encoding is stable.
pub type Headers = BTreeMap<String, String>;

/// Address of one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A record as it exists in a partition log.
///
/// Immutable once appended. `offset` is assigned by the log store and is
/// never taken from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    /// Enqueue time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// The record is not deliverable before this instant.
    pub deliver_at_ms: Option<u64>,
    /// Routing key; used for partition selection only.
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Record {
    /// Whether the record may be handed to a consumer at `now_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.deliver_at_ms.is_none_or(|at| at <= now_ms)
    }
}

/// Append input: everything but the offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRecord {
    pub timestamp_ms: u64,
    pub deliver_at_ms: Option<u64>,
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl NewRecord {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Bind the record to its log position.
    pub fn at_offset(self, offset: u64) -> Record {
        Record {
            offset,
            timestamp_ms: self.timestamp_ms,
            deliver_at_ms: self.deliver_at_ms,
            key: self.key,
            headers: self.headers,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_without_delay() {
        let rec = NewRecord::new(b"x".to_vec()).at_offset(3);
        assert!(rec.is_due(0));
        assert_eq!(rec.offset, 3);
    }

    #[test]
    fn delayed_record_becomes_due() {
        let mut rec = NewRecord::new(b"x".to_vec()).at_offset(0);
        rec.deliver_at_ms = Some(1_000);
        assert!(!rec.is_due(999));
        assert!(rec.is_due(1_000));
    }

    #[test]
    fn topic_partition_display() {
        assert_eq!(TopicPartition::new("orders", 2).to_string(), "orders/2");
    }
}
