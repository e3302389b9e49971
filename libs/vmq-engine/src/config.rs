use serde::Deserialize;

use crate::error::BrokerError;

/// Engine configuration. Every field has a default, so an empty TOML
/// document is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// How long a delivered record stays leased before it is redelivered.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// A member without heartbeat for this long is evicted from its groups.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Upper bound on how long the sweeper sleeps between passes.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Leases a member may hold per group when it does not ask for a limit.
    #[serde(default = "default_prefetch")]
    pub default_prefetch: usize,

    /// Create unknown topics on first publish or subscribe.
    #[serde(default = "default_true")]
    pub auto_create_topics: bool,

    /// Partition count of auto-created topics.
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Topics declared at startup.
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

fn default_lease_timeout_ms() -> u64 {
    30_000
}
fn default_session_timeout_ms() -> u64 {
    30_000
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_prefetch() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_partitions() -> u32 {
    1
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: default_lease_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            default_prefetch: default_prefetch(),
            auto_create_topics: default_true(),
            default_partitions: default_partitions(),
            dead_letter: DeadLetterConfig::default(),
            retention: RetentionConfig::default(),
            topics: Vec::new(),
        }
    }
}

/// What happens to a record once it has been delivered `max_attempts` times
/// without being acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Settle the record and log it.
    #[default]
    Drop,
    /// Copy the record to `<topic><suffix>`, then settle it.
    DeadLetterTopic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    /// 0 means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
    #[serde(default = "default_dlq_suffix")]
    pub topic_suffix: String,
}

fn default_dlq_suffix() -> String {
    ".dlq".to_string()
}

impl DeadLetterConfig {
    /// Dead-letter topic of `topic`, when exhausted records are moved.
    pub fn topic_for(&self, topic: &str) -> Option<String> {
        (self.on_exhausted == ExhaustedPolicy::DeadLetterTopic)
            .then(|| format!("{topic}{}", self.topic_suffix))
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            on_exhausted: ExhaustedPolicy::default(),
            topic_suffix: default_dlq_suffix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Drop records older than this.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
    /// Keep at most this many records per partition.
    #[serde(default)]
    pub max_records: Option<u64>,
    #[serde(default = "default_retention_interval_ms")]
    pub interval_ms: u64,
}

fn default_retention_interval_ms() -> u64 {
    6 * 60 * 60 * 1000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_ms: None,
            max_records: None,
            interval_ms: default_retention_interval_ms(),
        }
    }
}

impl RetentionConfig {
    pub fn enabled(&self) -> bool {
        self.max_age_ms.is_some() || self.max_records.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.lease_timeout_ms == 0 {
            return Err(BrokerError::Config("lease_timeout_ms must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(BrokerError::Config("sweep_interval_ms must be > 0".into()));
        }
        if self.default_prefetch == 0 {
            return Err(BrokerError::Config("default_prefetch must be > 0".into()));
        }
        if self.default_partitions == 0 {
            return Err(BrokerError::Config("default_partitions must be > 0".into()));
        }
        if self.dead_letter.on_exhausted == ExhaustedPolicy::DeadLetterTopic
            && self.dead_letter.topic_suffix.is_empty()
        {
            return Err(BrokerError::Config("dead_letter.topic_suffix must not be empty".into()));
        }
        if self.retention.enabled() && self.retention.interval_ms == 0 {
            return Err(BrokerError::Config("retention.interval_ms must be > 0".into()));
        }
        for topic in &self.topics {
            crate::registry::validate_topic_name(&topic.name)
                .map_err(|e| BrokerError::Config(e.to_string()))?;
            if topic.partitions == 0 {
                return Err(BrokerError::Config(format!("topic '{}': partitions must be > 0", topic.name)));
            }
            if let Some(dlq) = self.dead_letter.topic_for(&topic.name) {
                crate::registry::validate_topic_name(&dlq)
                    .map_err(|e| BrokerError::Config(format!("dead-letter topic of '{}': {e}", topic.name)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<BrokerConfig, BrokerError> {
        let config: BrokerConfig = toml::from_str(toml_str).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.lease_timeout_ms, 30_000);
        assert_eq!(cfg.default_prefetch, 10);
        assert!(cfg.auto_create_topics);
        assert_eq!(cfg.dead_letter.max_attempts, 0);
        assert!(!cfg.retention.enabled());
    }

    #[test]
    fn full_document() {
        let cfg = parse(
            r#"
            lease_timeout_ms = 5000
            auto_create_topics = false

            [dead_letter]
            max_attempts = 3
            on_exhausted = "dead_letter_topic"

            [retention]
            max_age_ms = 86400000

            [[topics]]
            name = "orders"
            partitions = 4

            [[topics]]
            name = "audit"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.lease_timeout_ms, 5000);
        assert_eq!(cfg.dead_letter.on_exhausted, ExhaustedPolicy::DeadLetterTopic);
        assert_eq!(cfg.dead_letter.topic_suffix, ".dlq");
        assert!(cfg.retention.enabled());
        assert_eq!(cfg.topics[0].partitions, 4);
        assert_eq!(cfg.topics[1].partitions, 1);
    }

    #[test]
    fn rejects_zero_partitions_and_bad_names() {
        assert!(parse("[[topics]]\nname = \"t\"\npartitions = 0").is_err());
        assert!(parse("[[topics]]\nname = \"a/b\"").is_err());
        assert!(parse("lease_timeout_ms = 0").is_err());
    }

    #[test]
    fn dead_letter_topic_names_must_fit() {
        let long = "t".repeat(247);
        let doc = format!("[dead_letter]\non_exhausted = \"dead_letter_topic\"\n\n[[topics]]\nname = \"{long}\"");
        assert!(matches!(parse(&doc), Err(BrokerError::Config(_))));

        let cfg = parse(&format!("[[topics]]\nname = \"{long}\"")).unwrap();
        assert_eq!(cfg.dead_letter.topic_for(&long), None);
    }
}
