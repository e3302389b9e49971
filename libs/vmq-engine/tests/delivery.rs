use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vmq_api::{
    Clock, CommittedOffset, CursorStore, ManualClock, Metrics, NewRecord, NoopMetrics, PartitionLog,
    StorageBackend, StoreError, TopicPartition,
};
use vmq_engine::broker::{
    HEADER_ATTEMPTS, HEADER_MAX_ATTEMPTS, HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_TOPIC,
};
use vmq_engine::{
    Broker, BrokerConfig, BrokerCounters, BrokerError, ExhaustedPolicy, TruncateOutcome,
};
use vmq_storage_file::{FileStorage, FileStorageConfig};
use vmq_storage_memory::{MemoryCursorStore, MemoryStorage};

fn open_with(
    config: BrokerConfig,
    backend: Arc<dyn StorageBackend>,
    clock: Arc<ManualClock>,
    metrics: Arc<dyn Metrics>,
) -> Broker {
    let clock: Arc<dyn Clock> = clock;
    Broker::open(config, backend, clock, metrics).unwrap()
}

fn memory_broker(config: BrokerConfig) -> (Broker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let broker = open_with(
        config,
        Arc::new(MemoryStorage::default()),
        clock.clone(),
        Arc::new(NoopMetrics),
    );
    (broker, clock)
}

fn publish(broker: &Broker, topic: &str, payload: &str) -> u64 {
    broker
        .publish(topic, NewRecord::new(payload.as_bytes().to_vec()))
        .unwrap()
        .offset
}

fn join(broker: &Broker, group: &str, member: &str, topic: &str, prefetch: usize) {
    broker
        .subscribe_group(group, member, &[topic.to_string()], Some(prefetch), None)
        .unwrap();
}

fn polled(broker: &Broker, group: &str, member: &str) -> Vec<(u64, u32)> {
    broker
        .poll(group, member, usize::MAX)
        .unwrap()
        .into_iter()
        .map(|d| (d.record.offset, d.attempt))
        .collect()
}

#[test]
fn ack_commits_and_nack_redelivers_first() {
    let (broker, _) = memory_broker(BrokerConfig::default());
    let offsets: Vec<u64> = ["a", "b", "c"].iter().map(|p| publish(&broker, "orders", p)).collect();
    assert_eq!(offsets, vec![0, 1, 2]);

    let tp = TopicPartition::new("orders", 0);
    join(&broker, "g", "m1", "orders", 1);

    assert_eq!(polled(&broker, "g", "m1"), vec![(0, 1)]);
    assert_eq!(broker.ack("g", "m1", &tp, 0).unwrap(), Some(0));

    assert_eq!(polled(&broker, "g", "m1"), vec![(1, 1)]);
    broker.nack("g", "m1", &tp, 1).unwrap();
    assert_eq!(polled(&broker, "g", "m1"), vec![(1, 2)]);

    assert_eq!(broker.ack("g", "m1", &tp, 1).unwrap(), Some(1));
    assert_eq!(polled(&broker, "g", "m1"), vec![(2, 1)]);
    assert_eq!(broker.committed_offset("g", &tp), Some(1));
}

#[test]
fn out_of_order_acks_hold_the_cursor_back() {
    let (broker, _) = memory_broker(BrokerConfig::default());
    for p in ["a", "b", "c"] {
        publish(&broker, "t", p);
    }
    let tp = TopicPartition::new("t", 0);
    join(&broker, "g", "m1", "t", 10);
    assert_eq!(polled(&broker, "g", "m1").len(), 3);

    assert_eq!(broker.ack("g", "m1", &tp, 2).unwrap(), None);
    assert_eq!(broker.ack("g", "m1", &tp, 1).unwrap(), None);
    assert_eq!(broker.ack("g", "m1", &tp, 0).unwrap(), Some(2));
    assert!(matches!(
        broker.ack("g", "m1", &tp, 1),
        Err(BrokerError::AlreadySettled { .. })
    ));
}

#[test]
fn expired_lease_is_redelivered_once() {
    let config = BrokerConfig {
        lease_timeout_ms: 5_000,
        ..Default::default()
    };
    let (broker, clock) = memory_broker(config);
    publish(&broker, "t", "x");
    let tp = TopicPartition::new("t", 0);
    join(&broker, "g", "m1", "t", 10);

    assert_eq!(polled(&broker, "g", "m1"), vec![(0, 1)]);
    assert_eq!(broker.next_timer_due(), Some(5_000));

    clock.advance(4_999);
    assert_eq!(broker.sweep().expired, 0);
    assert!(polled(&broker, "g", "m1").is_empty());

    clock.advance(1);
    assert_eq!(broker.sweep().expired, 1);
    assert_eq!(broker.sweep().expired, 0);
    assert_eq!(broker.committed_offset("g", &tp), None);

    assert_eq!(polled(&broker, "g", "m1"), vec![(0, 2)]);
    assert_eq!(broker.ack("g", "m1", &tp, 0).unwrap(), Some(0));
}

#[test]
fn committed_offset_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = || -> Arc<dyn StorageBackend> {
        Arc::new(FileStorage::open(FileStorageConfig::new(dir.path().display().to_string())).unwrap())
    };
    let tp = TopicPartition::new("events", 0);

    {
        let broker = open_with(
            BrokerConfig::default(),
            backend(),
            Arc::new(ManualClock::new(0)),
            Arc::new(NoopMetrics),
        );
        for p in ["a", "b", "c"] {
            publish(&broker, "events", p);
        }
        join(&broker, "g", "m1", "events", 2);
        assert_eq!(polled(&broker, "g", "m1"), vec![(0, 1), (1, 1)]);
        broker.ack("g", "m1", &tp, 0).unwrap();
        broker.ack("g", "m1", &tp, 1).unwrap();
        broker.flush().unwrap();
    }

    let broker = open_with(
        BrokerConfig::default(),
        backend(),
        Arc::new(ManualClock::new(0)),
        Arc::new(NoopMetrics),
    );
    assert_eq!(broker.partitions_of("events"), vec![tp.clone()]);
    assert_eq!(broker.committed_offset("g", &tp), Some(1));
    assert_eq!(broker.high_water_mark(&tp).unwrap(), 3);

    join(&broker, "g", "m2", "events", 10);
    assert_eq!(polled(&broker, "g", "m2"), vec![(2, 1)]);
}

#[test]
fn partitions_move_when_members_join_and_leave() {
    let (broker, _) = memory_broker(BrokerConfig::default());
    broker.create_topic("t", 2).unwrap();
    let p0 = TopicPartition::new("t", 0);
    let p1 = TopicPartition::new("t", 1);
    assert_eq!(broker.publish("t", NewRecord::new(b"a".to_vec())).unwrap().tp, p0);
    assert_eq!(broker.publish("t", NewRecord::new(b"b".to_vec())).unwrap().tp, p1);

    join(&broker, "g", "m1", "t", 10);
    assert_eq!(polled(&broker, "g", "m1").len(), 2);

    let assignment = broker
        .subscribe_group("g", "m2", &["t".to_string()], None, None)
        .unwrap();
    assert_eq!(assignment.partitions, vec![p1.clone()]);

    // m1's lease on the moved partition was revoked.
    assert!(matches!(
        broker.ack("g", "m1", &p1, 0),
        Err(BrokerError::NotOwner { .. })
    ));
    let redelivered = broker.poll("g", "m2", 10).unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].tp, p1);
    assert_eq!(redelivered[0].attempt, 2);

    broker.leave("g", "m2").unwrap();
    let group = broker.describe_group("g").unwrap();
    assert_eq!(group.members.len(), 1);
    assert_eq!(group.members[0].partitions, vec![p0, p1]);
    assert!(matches!(
        broker.poll("g", "m2", 10),
        Err(BrokerError::NotMember { .. })
    ));
}

#[test]
fn exhausted_records_go_to_dead_letter_topic() {
    let mut config = BrokerConfig::default();
    config.dead_letter.max_attempts = 2;
    config.dead_letter.on_exhausted = ExhaustedPolicy::DeadLetterTopic;
    let counters = Arc::new(BrokerCounters::default());
    let broker = open_with(
        config,
        Arc::new(MemoryStorage::default()),
        Arc::new(ManualClock::new(0)),
        counters.clone(),
    );

    publish(&broker, "jobs", "poison");
    publish(&broker, "jobs", "fine");
    let tp = TopicPartition::new("jobs", 0);
    join(&broker, "g", "m1", "jobs", 1);

    for attempt in 1..=2 {
        assert_eq!(polled(&broker, "g", "m1"), vec![(0, attempt)]);
        broker.nack("g", "m1", &tp, 0).unwrap();
    }
    assert_eq!(polled(&broker, "g", "m1"), vec![(1, 1)]);
    assert_eq!(broker.committed_offset("g", &tp), Some(0));

    let dlq = broker.read(&TopicPartition::new("jobs.dlq", 0), 0, 10).unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].payload, b"poison");
    assert_eq!(dlq[0].headers[HEADER_ORIGINAL_TOPIC], "jobs");
    assert_eq!(dlq[0].headers[HEADER_ORIGINAL_OFFSET], "0");
    assert_eq!(dlq[0].headers[HEADER_ATTEMPTS], "2");

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.nacked, 2);
    assert_eq!(snapshot.redelivered, 1);
}

#[test]
fn delayed_record_waits_for_its_time() {
    let (broker, clock) = memory_broker(BrokerConfig::default());
    clock.set(1_000);
    let mut later = NewRecord::new(b"later".to_vec());
    later.deliver_at_ms = Some(6_000);
    broker.publish("t", later).unwrap();
    publish(&broker, "t", "now");
    join(&broker, "g", "m1", "t", 10);

    assert_eq!(polled(&broker, "g", "m1"), vec![(1, 1)]);
    assert_eq!(broker.next_timer_due(), Some(6_000));

    clock.set(6_000);
    assert_eq!(broker.sweep().promoted, 1);
    assert_eq!(polled(&broker, "g", "m1"), vec![(0, 1)]);
}

#[test]
fn silent_members_are_evicted() {
    let config = BrokerConfig {
        session_timeout_ms: 1_000,
        ..Default::default()
    };
    let (broker, clock) = memory_broker(config);
    join(&broker, "g", "quiet", "t", 10);
    join(&broker, "g", "chatty", "t", 10);

    clock.advance(800);
    broker.heartbeat("g", "chatty").unwrap();
    clock.advance(800);

    assert_eq!(broker.sweep().evicted, 1);
    let group = broker.describe_group("g").unwrap();
    let members: Vec<&str> = group.members.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(members, vec!["chatty"]);
    assert_eq!(group.members[0].partitions, vec![TopicPartition::new("t", 0)]);
}

#[test]
fn retention_stops_at_the_slowest_group() {
    let mut config = BrokerConfig::default();
    config.retention.max_records = Some(2);
    let (broker, _) = memory_broker(config);
    for i in 0..5 {
        publish(&broker, "t", &i.to_string());
    }
    let tp = TopicPartition::new("t", 0);
    join(&broker, "g", "m1", "t", 10);

    assert!(broker.apply_retention().is_empty());

    assert_eq!(polled(&broker, "g", "m1").len(), 5);
    for offset in 0..3 {
        broker.ack("g", "m1", &tp, offset).unwrap();
    }
    assert_eq!(
        broker.apply_retention(),
        vec![(tp.clone(), TruncateOutcome::Truncated { earliest: 3 })]
    );
    assert_eq!(
        broker.truncate_before(&tp, 5).unwrap(),
        TruncateOutcome::Refused { floor: 3 }
    );
}

#[test]
fn unknown_topics_are_rejected_without_auto_create() {
    let config = BrokerConfig {
        auto_create_topics: false,
        ..Default::default()
    };
    let (broker, _) = memory_broker(config);
    assert!(matches!(
        broker.publish("missing", NewRecord::new(b"x".to_vec())),
        Err(BrokerError::UnknownTopic(_))
    ));
    assert!(matches!(
        broker.poll("nobody", "m", 1),
        Err(BrokerError::UnknownGroup(_))
    ));
}

fn dead_letter_config(max_attempts: u32) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.dead_letter.max_attempts = max_attempts;
    config.dead_letter.on_exhausted = ExhaustedPolicy::DeadLetterTopic;
    config
}

#[test]
fn failing_partition_does_not_starve_the_others() {
    let broker = open_with(
        dead_letter_config(1),
        Arc::new(MemoryStorage::new(2)),
        Arc::new(ManualClock::new(0)),
        Arc::new(NoopMetrics),
    );
    broker.create_topic("jobs", 2).unwrap();
    broker.create_topic("jobs.dlq", 1).unwrap();
    publish(&broker, "jobs.dlq", "old-1");
    publish(&broker, "jobs.dlq", "old-2");

    let p0 = TopicPartition::new("jobs", 0);
    let p1 = TopicPartition::new("jobs", 1);
    assert_eq!(broker.publish("jobs", NewRecord::new(b"poison".to_vec())).unwrap().tp, p0);
    join(&broker, "g", "m", "jobs", 10);
    assert_eq!(polled(&broker, "g", "m"), vec![(0, 1)]);
    broker.nack("g", "m", &p0, 0).unwrap();

    // jobs/0 cannot dead-letter its record (jobs.dlq is full); jobs/1 still delivers.
    assert_eq!(broker.publish("jobs", NewRecord::new(b"healthy".to_vec())).unwrap().tp, p1);
    let delivered = broker.poll("g", "m", 10).unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].tp, p1);
    assert_eq!(delivered[0].record.payload, b"healthy");
    assert!(broker.poll("g", "m", 10).unwrap().is_empty());
    let in_flight = broker
        .describe_group("g")
        .unwrap()
        .partitions
        .into_iter()
        .find(|p| p.tp == p1)
        .map(|p| p.in_flight);
    assert_eq!(in_flight, Some(1));
    assert_eq!(broker.committed_offset("g", &p0), None);

    // With nothing healthy left to visit, the failure is reported.
    broker.create_topic("solo", 1).unwrap();
    broker.create_topic("solo.dlq", 1).unwrap();
    publish(&broker, "solo.dlq", "old-1");
    publish(&broker, "solo.dlq", "old-2");
    publish(&broker, "solo", "poison");
    let solo = TopicPartition::new("solo", 0);
    join(&broker, "h", "m", "solo", 10);
    assert_eq!(polled(&broker, "h", "m"), vec![(0, 1)]);
    broker.nack("h", "m", &solo, 0).unwrap();
    assert!(matches!(
        broker.poll("h", "m", 10),
        Err(BrokerError::StoreUnavailable(_))
    ));
}

#[test]
fn record_attempt_limit_overrides_the_default() {
    let broker = open_with(
        dead_letter_config(0),
        Arc::new(MemoryStorage::default()),
        Arc::new(ManualClock::new(0)),
        Arc::new(NoopMetrics),
    );
    let tp = TopicPartition::new("jobs", 0);
    broker
        .publish("jobs", NewRecord::new(b"once".to_vec()).with_header(HEADER_MAX_ATTEMPTS, "1"))
        .unwrap();
    publish(&broker, "jobs", "unlimited");
    join(&broker, "g", "m", "jobs", 1);

    assert_eq!(polled(&broker, "g", "m"), vec![(0, 1)]);
    broker.nack("g", "m", &tp, 0).unwrap();
    assert_eq!(polled(&broker, "g", "m"), vec![(1, 1)]);
    assert_eq!(broker.committed_offset("g", &tp), Some(0));

    for attempt in 2..=4 {
        broker.nack("g", "m", &tp, 1).unwrap();
        assert_eq!(polled(&broker, "g", "m"), vec![(1, attempt)]);
    }

    let dlq = broker.read(&TopicPartition::new("jobs.dlq", 0), 0, 10).unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].payload, b"once");
    assert_eq!(dlq[0].headers[HEADER_ATTEMPTS], "1");
}

#[test]
fn topics_need_a_valid_dead_letter_name() {
    let (broker, _) = memory_broker(dead_letter_config(3));
    let too_long = "t".repeat(246);
    assert!(matches!(
        broker.publish(&too_long, NewRecord::new(b"x".to_vec())),
        Err(BrokerError::InvalidRequest(_))
    ));
    assert!(broker.topics().is_empty());

    let fits = "t".repeat(245);
    assert_eq!(publish(&broker, &fits, "x"), 0);
}

/// Cursor store whose commits can be switched to fail.
#[derive(Default)]
struct FlakyCommits {
    inner: MemoryCursorStore,
    failing: AtomicBool,
}

impl CursorStore for FlakyCommits {
    fn commit(&self, group: &str, tp: &TopicPartition, offset: u64) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("cursor store offline"));
        }
        self.inner.commit(group, tp, offset)
    }

    fn load(&self) -> Result<Vec<CommittedOffset>, StoreError> {
        self.inner.load()
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct FlakyBackend {
    logs: MemoryStorage,
    cursors: Arc<FlakyCommits>,
}

impl StorageBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn open_partition(&self, tp: &TopicPartition) -> Result<Box<dyn PartitionLog>, StoreError> {
        self.logs.open_partition(tp)
    }

    fn cursor_store(&self) -> Arc<dyn CursorStore> {
        self.cursors.clone()
    }

    fn discover(&self) -> Result<Vec<(String, u32)>, StoreError> {
        self.logs.discover()
    }
}

#[test]
fn ack_fails_when_the_commit_is_not_durable() {
    let cursors = Arc::new(FlakyCommits::default());
    let broker = open_with(
        BrokerConfig::default(),
        Arc::new(FlakyBackend {
            logs: MemoryStorage::default(),
            cursors: cursors.clone(),
        }),
        Arc::new(ManualClock::new(0)),
        Arc::new(NoopMetrics),
    );
    let tp = TopicPartition::new("t", 0);
    publish(&broker, "t", "x");
    join(&broker, "g", "m", "t", 10);
    assert_eq!(polled(&broker, "g", "m"), vec![(0, 1)]);

    cursors.failing.store(true, Ordering::SeqCst);
    assert!(matches!(
        broker.ack("g", "m", &tp, 0),
        Err(BrokerError::StoreUnavailable(_))
    ));
    assert_eq!(broker.committed_offset("g", &tp), None);
    assert_eq!(broker.describe_group("g").unwrap().partitions[0].in_flight, 1);

    cursors.failing.store(false, Ordering::SeqCst);
    assert_eq!(broker.ack("g", "m", &tp, 0).unwrap(), Some(0));
    assert_eq!(cursors.inner.load().unwrap().len(), 1);
}

#[test]
fn publish_reports_a_full_partition() {
    let clock = Arc::new(ManualClock::new(0));
    let broker = open_with(
        BrokerConfig::default(),
        Arc::new(MemoryStorage::new(2)),
        clock,
        Arc::new(NoopMetrics),
    );
    let tp = TopicPartition::new("t", 0);
    publish(&broker, "t", "a");
    publish(&broker, "t", "b");
    assert!(matches!(
        broker.publish("t", NewRecord::new(b"c".to_vec())),
        Err(BrokerError::StoreUnavailable(_))
    ));
    assert_eq!(broker.high_water_mark(&tp).unwrap(), 2);

    join(&broker, "g", "m", "t", 10);
    assert_eq!(polled(&broker, "g", "m"), vec![(0, 1), (1, 1)]);
}

#[test]
fn concurrent_publishers_get_dense_offsets() {
    let (broker, _) = memory_broker(BrokerConfig::default());
    broker.create_topic("t", 1).unwrap();

    let per_thread: Vec<Vec<u64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let broker = &broker;
                s.spawn(move || {
                    (0..200)
                        .map(|i| publish(broker, "t", &format!("{worker}-{i}")))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for offsets in &per_thread {
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }
    let mut all = per_thread.concat();
    all.sort_unstable();
    assert_eq!(all, (0..1600).collect::<Vec<u64>>());
    assert_eq!(broker.high_water_mark(&TopicPartition::new("t", 0)).unwrap(), 1600);
}
