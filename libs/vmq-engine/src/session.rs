use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use vmq_api::{Event, NewRecord, Operation, TopicPartition};

use crate::broker::{Broker, HEADER_MAX_ATTEMPTS};
use crate::error::BrokerError;
use crate::scheduler::WaitHandle;
use crate::tracker::MemberId;

/// Pause before polling again after hitting a rebalance.
const REBALANCE_RETRY_MS: u64 = 50;

/// Engine side of one client connection.
///
/// The transport decodes frames into `Operation`s, feeds them to `handle`,
/// and writes back the returned events. Between frames it awaits `ready`
/// and then calls `poll` to pick up deliveries. Dropping the session leaves
/// every group it joined.
pub struct Session {
    member: MemberId,
    broker: Arc<Broker>,
    /// Joined groups and the topics subscribed in each.
    groups: BTreeMap<String, Vec<String>>,
    wait: Option<WaitHandle>,
    retry_at_ms: Option<u64>,
}

impl Session {
    pub fn open(broker: Arc<Broker>) -> Self {
        let member = broker.new_member_id();
        broker.metrics().record_session(true);
        tracing::info!(member = %member, "session opened");
        Self {
            member,
            broker,
            groups: BTreeMap::new(),
            wait: None,
            retry_at_ms: None,
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Apply one client operation. Failures become `Event::Error`; they
    /// never end the session.
    pub fn handle(&mut self, op: Operation) -> Vec<Event> {
        let name = op.name();
        self.touch();
        match self.dispatch(op) {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!(member = %self.member, op = name, error = %e, "operation rejected");
                vec![error_event(&e)]
            }
        }
    }

    fn dispatch(&mut self, op: Operation) -> Result<Vec<Event>, BrokerError> {
        match op {
            Operation::Publish {
                topic,
                key,
                payload,
                delay_ms,
                deliver_at_ms,
                max_attempts,
                headers,
            } => {
                let mut record = NewRecord::new(payload);
                record.key = key;
                record.headers = headers;
                record.deliver_at_ms = match (delay_ms.filter(|d| *d > 0), deliver_at_ms) {
                    (Some(_), Some(_)) => {
                        return Err(BrokerError::InvalidRequest(
                            "publish takes `delay_ms` or `deliver_at_ms`, not both".into(),
                        ));
                    }
                    (Some(delay), None) => Some(self.broker.now_ms().saturating_add(delay)),
                    (None, at) => at,
                };
                if let Some(limit) = max_attempts {
                    record.headers.insert(HEADER_MAX_ATTEMPTS.into(), limit.to_string());
                }
                let published = self.broker.publish(&topic, record)?;
                Ok(vec![Event::Published {
                    tp: published.tp,
                    offset: published.offset,
                }])
            }

            Operation::Subscribe {
                group,
                topics,
                prefetch,
                start,
            } => {
                let assignment =
                    self.broker
                        .subscribe_group(&group, &self.member, &topics, prefetch, start)?;
                self.groups.insert(group, topics);
                self.refresh_wait();
                let mut events = vec![Event::Subscribed {
                    group: assignment.group,
                    generation: assignment.generation,
                    assignment: assignment.partitions,
                }];
                events.extend(self.poll());
                Ok(events)
            }

            Operation::Unsubscribe { group } => {
                if self.groups.remove(&group).is_none() {
                    return Err(self.not_member(&group));
                }
                self.refresh_wait();
                self.broker.leave(&group, &self.member)?;
                Ok(vec![Event::Unsubscribed { group }])
            }

            Operation::Ack {
                group,
                topic,
                partition,
                offset,
            } => {
                self.joined(&group)?;
                let tp = TopicPartition::new(topic, partition);
                let committed = self.broker.ack(&group, &self.member, &tp, offset)?;
                let mut events = vec![Event::Acked {
                    group,
                    tp,
                    offset,
                    committed,
                }];
                // The ack freed a prefetch slot.
                events.extend(self.poll());
                Ok(events)
            }

            Operation::Nack {
                group,
                topic,
                partition,
                offset,
            } => {
                self.joined(&group)?;
                let tp = TopicPartition::new(topic, partition);
                self.broker.nack(&group, &self.member, &tp, offset)?;
                Ok(vec![Event::Nacked { group, tp, offset }])
            }

            Operation::Heartbeat => Ok(vec![Event::HeartbeatOk]),

            Operation::Ping => Ok(vec![Event::Pong {
                timestamp_ms: self.broker.now_ms(),
            }]),
        }
    }

    /// Lease whatever is deliverable to this session right now.
    pub fn poll(&mut self) -> Vec<Event> {
        let now = self.broker.now_ms();
        if self.retry_at_ms.is_some_and(|at| now < at) {
            return Vec::new();
        }
        self.retry_at_ms = None;

        let mut events = Vec::new();
        let mut evicted = Vec::new();
        for group in self.groups.keys() {
            match self.broker.poll(group, &self.member, usize::MAX) {
                Ok(deliveries) => events.extend(deliveries.into_iter().map(Event::Delivery)),
                Err(BrokerError::RebalanceInProgress(_)) => {
                    self.retry_at_ms = Some(now + REBALANCE_RETRY_MS);
                }
                Err(e @ (BrokerError::NotMember { .. } | BrokerError::UnknownGroup(_))) => {
                    tracing::warn!(member = %self.member, group = %group, "session no longer in group");
                    events.push(error_event(&e));
                    evicted.push(group.clone());
                }
                Err(e) => events.push(error_event(&e)),
            }
        }
        if !evicted.is_empty() {
            for group in &evicted {
                self.groups.remove(group);
            }
            self.refresh_wait();
        }
        events
    }

    /// Resolves when `poll` may have something new.
    pub async fn ready(&self) {
        if let Some(at) = self.retry_at_ms {
            let delay = at.saturating_sub(self.broker.now_ms());
            tokio::time::sleep(Duration::from_millis(delay)).await;
            return;
        }
        match &self.wait {
            Some(wait) => wait.notified().await,
            None => std::future::pending().await,
        }
    }

    /// Every inbound frame counts as liveness for all joined groups.
    fn touch(&self) {
        for group in self.groups.keys() {
            if let Err(e) = self.broker.heartbeat(group, &self.member) {
                tracing::debug!(member = %self.member, group = %group, error = %e, "heartbeat rejected");
            }
        }
    }

    /// Wait on every partition of every subscribed topic, owned or not, so
    /// that assignment changes wake the session too.
    fn refresh_wait(&mut self) {
        let mut tps: Vec<TopicPartition> = self
            .groups
            .values()
            .flatten()
            .flat_map(|topic| self.broker.partitions_of(topic))
            .collect();
        tps.sort();
        tps.dedup();
        self.wait = (!tps.is_empty()).then(|| self.broker.wait_handle(&tps));
    }

    fn joined(&self, group: &str) -> Result<(), BrokerError> {
        if self.groups.contains_key(group) {
            Ok(())
        } else {
            Err(self.not_member(group))
        }
    }

    fn not_member(&self, group: &str) -> BrokerError {
        BrokerError::NotMember {
            group: group.to_string(),
            member: self.member.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.wait = None;
        for group in self.groups.keys() {
            if let Err(e) = self.broker.leave(group, &self.member) {
                tracing::debug!(member = %self.member, group = %group, error = %e, "leave on close failed");
            }
        }
        self.broker.metrics().record_session(false);
        tracing::info!(member = %self.member, groups = self.groups.len(), "session closed");
    }
}

pub fn error_event(e: &BrokerError) -> Event {
    Event::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmq_api::{ErrorKind, ManualClock, NoopMetrics};
    use vmq_storage_memory::MemoryStorage;

    use crate::config::BrokerConfig;

    fn broker() -> Arc<Broker> {
        Arc::new(
            Broker::open(
                BrokerConfig::default(),
                Arc::new(MemoryStorage::default()),
                Arc::new(ManualClock::new(1_000)),
                Arc::new(NoopMetrics),
            )
            .unwrap(),
        )
    }

    fn publish(topic: &str, payload: &[u8]) -> Operation {
        Operation::Publish {
            topic: topic.into(),
            key: None,
            payload: payload.to_vec(),
            delay_ms: None,
            deliver_at_ms: None,
            max_attempts: None,
            headers: Default::default(),
        }
    }

    fn subscribe(group: &str, topic: &str) -> Operation {
        Operation::Subscribe {
            group: group.into(),
            topics: vec![topic.into()],
            prefetch: None,
            start: None,
        }
    }

    fn offsets(events: &[Event]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Delivery(d) => Some(d.record.offset),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn subscribe_delivers_backlog() {
        let broker = broker();
        let mut producer = Session::open(broker.clone());
        for i in 0..3u8 {
            producer.handle(publish("jobs", &[i]));
        }

        let mut consumer = Session::open(broker);
        let events = consumer.handle(subscribe("workers", "jobs"));
        assert!(matches!(events[0], Event::Subscribed { .. }));
        assert_eq!(offsets(&events), vec![0, 1, 2]);
    }

    #[test]
    fn ack_for_unjoined_group_is_rejected() {
        let mut session = Session::open(broker());
        let events = session.handle(Operation::Ack {
            group: "g".into(),
            topic: "t".into(),
            partition: 0,
            offset: 0,
        });
        assert!(matches!(
            events.as_slice(),
            [Event::Error { kind: ErrorKind::NotMember, .. }]
        ));
    }

    #[test]
    fn closing_a_session_leaves_its_groups() {
        let broker = broker();
        let mut session = Session::open(broker.clone());
        session.handle(subscribe("g", "t"));
        assert_eq!(broker.describe_group("g").unwrap().members.len(), 1);
        drop(session);
        assert!(broker.describe_group("g").unwrap().members.is_empty());
    }

    #[tokio::test]
    async fn publish_wakes_subscribed_session() {
        let broker = broker();
        let mut consumer = Session::open(broker.clone());
        consumer.handle(subscribe("g", "t"));

        let mut producer = Session::open(broker);
        producer.handle(publish("t", b"hello"));

        tokio::time::timeout(Duration::from_secs(1), consumer.ready())
            .await
            .unwrap();
        assert_eq!(offsets(&consumer.poll()), vec![0]);
    }

    fn scheduled(delay_ms: Option<u64>, deliver_at_ms: Option<u64>, max_attempts: Option<u32>) -> Operation {
        Operation::Publish {
            topic: "t".into(),
            key: None,
            payload: b"x".to_vec(),
            delay_ms,
            deliver_at_ms,
            max_attempts,
            headers: Default::default(),
        }
    }

    #[test]
    fn publish_options_become_record_fields() {
        let broker = broker();
        let tp = TopicPartition::new("t", 0);
        let mut session = Session::open(broker.clone());

        let events = session.handle(scheduled(None, Some(9_000), Some(3)));
        assert!(matches!(events.as_slice(), [Event::Published { offset: 0, .. }]));
        let stored = broker.read(&tp, 0, 1).unwrap();
        assert_eq!(stored[0].deliver_at_ms, Some(9_000));
        assert_eq!(stored[0].headers[HEADER_MAX_ATTEMPTS], "3");

        session.handle(scheduled(Some(500), None, None));
        let stored = broker.read(&tp, 1, 1).unwrap();
        assert_eq!(stored[0].deliver_at_ms, Some(1_500));
        assert!(!stored[0].headers.contains_key(HEADER_MAX_ATTEMPTS));

        assert!(matches!(
            session.handle(scheduled(Some(500), Some(9_000), None)).as_slice(),
            [Event::Error { kind: ErrorKind::InvalidRequest, .. }]
        ));
        assert_eq!(broker.high_water_mark(&tp).unwrap(), 2);
    }

    #[test]
    fn ping_answers_with_clock_time() {
        let mut session = Session::open(broker());
        assert_eq!(session.handle(Operation::Ping), vec![Event::Pong { timestamp_ms: 1_000 }]);
    }
}
