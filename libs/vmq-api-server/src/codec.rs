use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use vmq_api::{Event, Headers, Operation, ProtocolError, SessionCodec, StartPosition, TopicPartition};

// ═══════════════════════════════════════════════════════════════
//  Wire types
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WsAction {
    Publish {
        topic: String,
        #[serde(default)]
        key: Option<String>,
        /// Base64 payload.
        #[serde(default)]
        payload: Option<String>,
        /// UTF-8 payload, sent as is.
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        delay_ms: Option<u64>,
        #[serde(default)]
        deliver_at_ms: Option<u64>,
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default)]
        headers: Headers,
    },
    Subscribe {
        group: String,
        topics: Vec<String>,
        #[serde(default)]
        prefetch: Option<usize>,
        #[serde(default)]
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

#[derive(Serialize)]
struct WsPartition<'a> {
    topic: &'a str,
    partition: u32,
}

impl<'a> From<&'a TopicPartition> for WsPartition<'a> {
    fn from(tp: &'a TopicPartition) -> Self {
        Self {
            topic: &tp.topic,
            partition: tp.partition,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsEvent<'a> {
    Published {
        topic: &'a str,
        partition: u32,
        offset: u64,
    },
    Subscribed {
        group: &'a str,
        generation: u64,
        assignment: Vec<WsPartition<'a>>,
    },
    Unsubscribed {
        group: &'a str,
    },
    Delivery {
        group: &'a str,
        topic: &'a str,
        partition: u32,
        offset: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<&'a str>,
        #[serde(skip_serializing_if = "no_headers")]
        headers: &'a Headers,
        payload: String,
        timestamp_ms: u64,
        attempt: u32,
        lease_expires_at_ms: u64,
    },
    Acked {
        group: &'a str,
        topic: &'a str,
        partition: u32,
        offset: u64,
        committed: Option<u64>,
    },
    Nacked {
        group: &'a str,
        topic: &'a str,
        partition: u32,
        offset: u64,
    },
    HeartbeatOk,
    Pong {
        timestamp_ms: u64,
    },
    Error {
        error_type: &'static str,
        message: &'a str,
        retryable: bool,
    },
}

fn no_headers(headers: &&Headers) -> bool {
    headers.is_empty()
}

// ═══════════════════════════════════════════════════════════════
//  JsonCodec
// ═══════════════════════════════════════════════════════════════

/// JSON text frames. Inbound frames are tagged by `action`, outbound by
/// `type`; binary payloads travel base64-encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl SessionCodec for JsonCodec {
    fn decode(&self, frame: &[u8]) -> Result<Operation, ProtocolError> {
        let action: WsAction = serde_json::from_slice(frame)?;
        Ok(match action {
            WsAction::Publish {
                topic,
                key,
                payload,
                text,
                delay_ms,
                deliver_at_ms,
                max_attempts,
                headers,
            } => {
                let payload = match (payload, text) {
                    (Some(encoded), None) => STANDARD
                        .decode(encoded)
                        .map_err(|e| ProtocolError::new(format!("payload is not base64: {e}")))?,
                    (None, Some(text)) => text.into_bytes(),
                    (None, None) => return Err(ProtocolError::new("publish needs `payload` or `text`")),
                    (Some(_), Some(_)) => {
                        return Err(ProtocolError::new("publish takes `payload` or `text`, not both"));
                    }
                };
                Operation::Publish {
                    topic,
                    key,
                    payload,
                    delay_ms,
                    deliver_at_ms,
                    max_attempts,
                    headers,
                }
            }
            WsAction::Subscribe {
                group,
                topics,
                prefetch,
                start,
            } => Operation::Subscribe {
                group,
                topics,
                prefetch,
                start,
            },
            WsAction::Unsubscribe { group } => Operation::Unsubscribe { group },
            WsAction::Ack {
                group,
                topic,
                partition,
                offset,
            } => Operation::Ack {
                group,
                topic,
                partition,
                offset,
            },
            WsAction::Nack {
                group,
                topic,
                partition,
                offset,
            } => Operation::Nack {
                group,
                topic,
                partition,
                offset,
            },
            WsAction::Heartbeat => Operation::Heartbeat,
            WsAction::Ping => Operation::Ping,
        })
    }

    fn encode(&self, event: &Event) -> Result<Vec<u8>, ProtocolError> {
        let wire = match event {
            Event::Published { tp, offset } => WsEvent::Published {
                topic: &tp.topic,
                partition: tp.partition,
                offset: *offset,
            },
            Event::Subscribed {
                group,
                generation,
                assignment,
            } => WsEvent::Subscribed {
                group,
                generation: *generation,
                assignment: assignment.iter().map(WsPartition::from).collect(),
            },
            Event::Unsubscribed { group } => WsEvent::Unsubscribed { group },
            Event::Delivery(d) => WsEvent::Delivery {
                group: &d.group,
                topic: &d.tp.topic,
                partition: d.tp.partition,
                offset: d.record.offset,
                key: d.record.key.as_deref(),
                headers: &d.record.headers,
                payload: STANDARD.encode(&d.record.payload),
                timestamp_ms: d.record.timestamp_ms,
                attempt: d.attempt,
                lease_expires_at_ms: d.lease_expires_at_ms,
            },
            Event::Acked {
                group,
                tp,
                offset,
                committed,
            } => WsEvent::Acked {
                group,
                topic: &tp.topic,
                partition: tp.partition,
                offset: *offset,
                committed: *committed,
            },
            Event::Nacked { group, tp, offset } => WsEvent::Nacked {
                group,
                topic: &tp.topic,
                partition: tp.partition,
                offset: *offset,
            },
            Event::HeartbeatOk => WsEvent::HeartbeatOk,
            Event::Pong { timestamp_ms } => WsEvent::Pong {
                timestamp_ms: *timestamp_ms,
            },
            Event::Error { kind, message } => WsEvent::Error {
                error_type: kind.as_str(),
                message,
                retryable: kind.retryable(),
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }
}
