use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use vmq_api::TopicPartition;

use crate::error::BrokerError;

const MAX_TOPIC_NAME: usize = 249;

/// Topic names double as directory names, so they are restricted to
/// `[A-Za-z0-9._-]` and may not be `.` or `..`.
pub fn validate_topic_name(name: &str) -> Result<(), BrokerError> {
    if name.is_empty() || name.len() > MAX_TOPIC_NAME {
        return Err(BrokerError::InvalidRequest(format!(
            "topic name must be 1..={MAX_TOPIC_NAME} bytes"
        )));
    }
    if name == "." || name == ".." {
        return Err(BrokerError::InvalidRequest(format!("invalid topic name '{name}'")));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(BrokerError::InvalidRequest(format!(
            "invalid character {c:?} in topic name '{name}'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMeta {
    pub name: String,
    pub partitions: u32,
}

struct TopicEntry {
    partitions: u32,
    round_robin: AtomicU64,
}

/// Topic name -> ordered partitions.
#[derive(Default)]
pub struct TopicRegistry {
    topics: RwLock<BTreeMap<String, Arc<TopicEntry>>>,
}

impl TopicRegistry {
    /// Declare a topic. An existing topic keeps its partition count.
    ///
    /// Returns the effective partition count and whether the topic is new.
    pub fn declare(&self, name: &str, partitions: u32) -> (u32, bool) {
        let mut topics = self.topics.write();
        if let Some(existing) = topics.get(name) {
            if existing.partitions != partitions {
                tracing::warn!(
                    topic = %name,
                    existing = existing.partitions,
                    requested = partitions,
                    "topic already exists with a different partition count"
                );
            }
            return (existing.partitions, false);
        }
        topics.insert(
            name.to_string(),
            Arc::new(TopicEntry {
                partitions,
                round_robin: AtomicU64::new(0),
            }),
        );
        (partitions, true)
    }

    /// Partition count of `name`, if the topic exists.
    pub fn resolve_partitions(&self, name: &str) -> Option<u32> {
        self.topics.read().get(name).map(|t| t.partitions)
    }

    pub fn topics(&self) -> Vec<TopicMeta> {
        self.topics
            .read()
            .iter()
            .map(|(name, t)| TopicMeta {
                name: name.clone(),
                partitions: t.partitions,
            })
            .collect()
    }

    pub fn partitions_of(&self, name: &str) -> Vec<TopicPartition> {
        self.resolve_partitions(name)
            .map(|n| (0..n).map(|p| TopicPartition::new(name, p)).collect())
            .unwrap_or_default()
    }

    /// Pick the partition for a publish: keyed records hash to a fixed
    /// partition, unkeyed ones rotate.
    pub fn partition_for(&self, name: &str, key: Option<&str>) -> Option<u32> {
        let entry = self.topics.read().get(name).cloned()?;
        let n = u64::from(entry.partitions);
        let slot = match key {
            Some(key) => u64::from(crc32fast::hash(key.as_bytes())),
            None => entry.round_robin.fetch_add(1, Ordering::Relaxed),
        };
        Some((slot % n) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_topic_name("orders.v1_eu-west").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("..").is_err());
        assert!(validate_topic_name("a/b").is_err());
        assert!(validate_topic_name(&"x".repeat(250)).is_err());
    }

    #[test]
    fn declare_keeps_existing_count() {
        let reg = TopicRegistry::default();
        assert_eq!(reg.declare("t", 3), (3, true));
        assert_eq!(reg.declare("t", 5), (3, false));
        assert_eq!(reg.resolve_partitions("t"), Some(3));
        assert_eq!(reg.resolve_partitions("u"), None);
    }

    #[test]
    fn keyed_records_stick_to_one_partition() {
        let reg = TopicRegistry::default();
        reg.declare("t", 4);
        let p = reg.partition_for("t", Some("customer-17")).unwrap();
        for _ in 0..10 {
            assert_eq!(reg.partition_for("t", Some("customer-17")), Some(p));
        }
        let spread: Vec<u32> = (0..4).filter_map(|_| reg.partition_for("t", None)).collect();
        assert_eq!(spread, vec![0, 1, 2, 3]);
    }
}
