use serde::Deserialize;

use crate::error::ErrorKind;
use crate::record::{Headers, Record, TopicPartition};

/// Where a group with no committed offset starts reading a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
}

/// Inbound client operation, independent of any transport encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Publish {
        topic: String,
        key: Option<String>,
        payload: Vec<u8>,
        /// Delay relative to now. Not combined with `deliver_at_ms`.
        delay_ms: Option<u64>,
        /// Absolute delivery time, epoch milliseconds.
        deliver_at_ms: Option<u64>,
        /// Delivery attempts before the record counts as exhausted, 0 for
        /// unlimited. Falls back to the broker default.
        max_attempts: Option<u32>,
        headers: Headers,
    },
    Subscribe {
        group: String,
        topics: Vec<String>,
        prefetch: Option<usize>,
        start: Option<StartPosition>,
    },
    Unsubscribe {
        group: String,
    },
    Ack {
        group: String,
        topic: String,
        partition: u32,
        offset: u64,
    },
    Nack {
        group: String,
        topic: String,
        partition: u32,
        offset: u64,
    },
    Heartbeat,
    Ping,
}

impl Operation {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Publish { .. } => "publish",
            Operation::Subscribe { .. } => "subscribe",
            Operation::Unsubscribe { .. } => "unsubscribe",
            Operation::Ack { .. } => "ack",
            Operation::Nack { .. } => "nack",
            Operation::Heartbeat => "heartbeat",
            Operation::Ping => "ping",
        }
    }
}

/// One leased record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub group: String,
    pub tp: TopicPartition,
    pub record: Record,
    /// 1 on first delivery.
    pub attempt: u32,
    pub lease_expires_at_ms: u64,
}

/// Outbound event for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Published {
        tp: TopicPartition,
        offset: u64,
    },
    Subscribed {
        group: String,
        generation: u64,
        assignment: Vec<TopicPartition>,
    },
    Unsubscribed {
        group: String,
    },
    Delivery(Delivery),
    Acked {
        group: String,
        tp: TopicPartition,
        offset: u64,
        committed: Option<u64>,
    },
    Nacked {
        group: String,
        tp: TopicPartition,
        offset: u64,
    },
    HeartbeatOk,
    Pong {
        timestamp_ms: u64,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}
