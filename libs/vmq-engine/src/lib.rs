//! Persistent message-queue engine: partition logs, consumer-group cursors,
//! leases and the broker facade tying them together.

pub mod broker;
pub mod config;
pub mod error;
pub mod group;
pub mod log;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod sweeper;
pub mod tracker;

pub use broker::{
    Assignment, Broker, GroupDescription, MemberDescription, PartitionDescription, Published,
    SweepReport,
};
pub use config::{BrokerConfig, DeadLetterConfig, ExhaustedPolicy, RetentionConfig, TopicConfig};
pub use error::BrokerError;
pub use group::GroupPhase;
pub use log::{LogReader, LogStore, TruncateOutcome};
pub use metrics::{BrokerCounters, CounterSnapshot};
pub use registry::{TopicMeta, TopicRegistry, validate_topic_name};
pub use session::Session;
pub use sweeper::{spawn_retention, spawn_sweeper};
pub use tracker::{Lease, LeaseError, MemberId, PartitionCursor};
