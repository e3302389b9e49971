use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use vmq_api::{
    Clock, CursorStore, Delivery, Metrics, NewRecord, Record, StartPosition, StorageBackend,
    TopicPartition,
};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::group::{ConsumerGroup, GroupPhase, GroupState, MemberState, assign};
use crate::log::{LogStore, TruncateOutcome};
use crate::registry::{TopicMeta, TopicRegistry, validate_topic_name};
use crate::scheduler::{LeaseTimer, WaitHandle, WaitSet, select};
use crate::tracker::{AckPlan, LeaseError, MemberId, PartitionCursor};

/// Headers added to records copied to a dead-letter topic.
pub const HEADER_ORIGINAL_TOPIC: &str = "x-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "x-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "x-original-offset";
pub const HEADER_ATTEMPTS: &str = "x-attempts";
pub const HEADER_GROUP: &str = "x-group";

/// Per-record delivery limit, overriding `dead_letter.max_attempts`.
pub const HEADER_MAX_ATTEMPTS: &str = "x-max-attempts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub tp: TopicPartition,
    pub offset: u64,
}

/// A member's view of its group after joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub group: String,
    pub generation: u64,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub promoted: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDescription {
    pub id: MemberId,
    pub topics: Vec<String>,
    pub prefetch: usize,
    pub last_heartbeat_ms: u64,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescription {
    pub tp: TopicPartition,
    pub owner: Option<MemberId>,
    pub committed: Option<u64>,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescription {
    pub name: String,
    pub phase: GroupPhase,
    pub generation: u64,
    pub members: Vec<MemberDescription>,
    pub partitions: Vec<PartitionDescription>,
}

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

/// Composition root of the engine.
///
/// Every entry point takes the locks it needs and releases them before
/// returning. Lock order: group state, then partition cursor, then
/// partition log.
pub struct Broker {
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    topics: TopicRegistry,
    log: LogStore,
    cursor_store: Arc<dyn CursorStore>,
    /// Committed offsets read at startup, by group.
    restored: HashMap<String, HashMap<TopicPartition, u64>>,
    groups: RwLock<HashMap<String, Arc<ConsumerGroup>>>,
    waiters: WaitSet,
    timers: Mutex<LeaseTimer>,
    timer_changed: Notify,
    next_member: AtomicU64,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.topics.topics().len())
            .field("groups", &self.groups.read().len())
            .field("timers", &self.timers.lock().len())
            .finish()
    }
}

impl Broker {
    pub fn open(
        config: BrokerConfig,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let log = LogStore::new(backend.clone(), metrics.clone());
        let topics = TopicRegistry::default();

        // --- 1. Topics already persisted ---
        for (name, partitions) in backend.discover()? {
            if let Err(e) = validate_topic_name(&name) {
                tracing::warn!(topic = %name, error = %e, "skipping persisted topic");
                continue;
            }
            topics.declare(&name, partitions);
        }

        // --- 2. Declared topics ---
        for topic in &config.topics {
            topics.declare(&topic.name, topic.partitions);
        }
        for meta in topics.topics() {
            for p in 0..meta.partitions {
                log.open(&TopicPartition::new(meta.name.as_str(), p))?;
            }
            tracing::info!(topic = %meta.name, partitions = meta.partitions, "topic ready");
        }

        // --- 3. Committed cursors ---
        let cursor_store = backend.cursor_store();
        let mut restored: HashMap<String, HashMap<TopicPartition, u64>> = HashMap::new();
        for entry in cursor_store.load()? {
            restored.entry(entry.group).or_default().insert(entry.tp, entry.offset);
        }

        tracing::info!(
            backend = backend.name(),
            topics = topics.topics().len(),
            groups = restored.len(),
            "broker opened"
        );

        Ok(Self {
            config,
            clock,
            metrics,
            topics,
            log,
            cursor_store,
            restored,
            groups: RwLock::new(HashMap::new()),
            waiters: WaitSet::default(),
            timers: Mutex::new(LeaseTimer::default()),
            timer_changed: Notify::new(),
            next_member: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    /// Fresh member id for a new session.
    pub fn new_member_id(&self) -> MemberId {
        format!("member-{}", self.next_member.fetch_add(1, Ordering::Relaxed))
    }

    // ───────────────────────────────────────────────────────────
    //  Topics
    // ───────────────────────────────────────────────────────────

    pub fn topics(&self) -> Vec<TopicMeta> {
        self.topics.topics()
    }

    pub fn partitions_of(&self, topic: &str) -> Vec<TopicPartition> {
        self.topics.partitions_of(topic)
    }

    /// Create a topic. An existing topic is left as it is.
    ///
    /// With the dead-letter topic policy, a name whose dead-letter topic
    /// would not be a valid name is rejected.
    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<u32, BrokerError> {
        validate_topic_name(name)?;
        if let Some(dlq) = self.config.dead_letter.topic_for(name) {
            validate_topic_name(&dlq).map_err(|e| {
                e.with_context(format!("topic '{name}' has no valid dead-letter topic '{dlq}'"))
            })?;
        }
        self.open_topic(name, partitions)
    }

    fn open_topic(&self, name: &str, partitions: u32) -> Result<u32, BrokerError> {
        validate_topic_name(name)?;
        if partitions == 0 {
            return Err(BrokerError::InvalidRequest("partitions must be > 0".into()));
        }
        if let Some(existing) = self.topics.resolve_partitions(name) {
            return Ok(existing);
        }
        for p in 0..partitions {
            self.log.open(&TopicPartition::new(name, p))?;
        }
        let (count, created) = self.topics.declare(name, partitions);
        if created {
            tracing::info!(topic = %name, partitions = count, "created topic");
        }
        Ok(count)
    }

    fn ensure_topic(&self, name: &str) -> Result<u32, BrokerError> {
        if let Some(n) = self.topics.resolve_partitions(name) {
            return Ok(n);
        }
        validate_topic_name(name)?;
        if !self.config.auto_create_topics {
            return Err(BrokerError::UnknownTopic(name.to_string()));
        }
        self.create_topic(name, self.config.default_partitions)
    }

    // ───────────────────────────────────────────────────────────
    //  Publish
    // ───────────────────────────────────────────────────────────

    /// Append a record to `topic`. The enqueue timestamp is set here; the
    /// record's `deliver_at_ms`, if any, is kept.
    pub fn publish(&self, topic: &str, mut record: NewRecord) -> Result<Published, BrokerError> {
        self.ensure_topic(topic)?;
        let partition = self
            .topics
            .partition_for(topic, record.key.as_deref())
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let tp = TopicPartition::new(topic, partition);
        record.timestamp_ms = self.now_ms();
        let offset = self.log.append(&tp, record)?;
        self.waiters.wake(&tp);
        Ok(Published { tp, offset })
    }

    // ───────────────────────────────────────────────────────────
    //  Groups
    // ───────────────────────────────────────────────────────────

    fn group(&self, name: &str) -> Result<Arc<ConsumerGroup>, BrokerError> {
        self.groups
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownGroup(name.to_string()))
    }

    fn group_or_create(&self, name: &str, start: StartPosition) -> Arc<ConsumerGroup> {
        if let Some(group) = self.groups.read().get(name) {
            return group.clone();
        }
        self.groups
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(group = %name, ?start, "created group");
                Arc::new(ConsumerGroup::new(name, start))
            })
            .clone()
    }

    /// Join `member` to `group` (or update its subscription) and rebalance.
    ///
    /// `start` only matters when the group is created.
    pub fn subscribe_group(
        &self,
        group: &str,
        member: &str,
        topics: &[String],
        prefetch: Option<usize>,
        start: Option<StartPosition>,
    ) -> Result<Assignment, BrokerError> {
        if group.is_empty() {
            return Err(BrokerError::InvalidRequest("group name must not be empty".into()));
        }
        if topics.is_empty() {
            return Err(BrokerError::InvalidRequest("subscribe needs at least one topic".into()));
        }
        if prefetch == Some(0) {
            return Err(BrokerError::InvalidRequest("prefetch must be > 0".into()));
        }
        for topic in topics {
            self.ensure_topic(topic)?;
        }

        let handle = self.group_or_create(group, start.unwrap_or_default());
        let prefetch = prefetch.unwrap_or(self.config.default_prefetch);
        let now = self.now_ms();

        let (wake, assignment) = {
            let mut state = handle.state.write();
            state.members.insert(
                member.to_string(),
                MemberState::new(topics.iter().cloned().collect(), prefetch, now),
            );
            tracing::info!(group, member, ?topics, prefetch, "member joined");
            let wake = self.rebalance_locked(&handle, &mut state)?;
            let assignment = Assignment {
                group: group.to_string(),
                generation: state.generation,
                partitions: state.owned_by(member),
            };
            (wake, assignment)
        };
        self.wake_all(&wake);
        Ok(assignment)
    }

    pub fn leave(&self, group: &str, member: &str) -> Result<(), BrokerError> {
        let handle = self.group(group)?;
        let wake = {
            let mut state = handle.state.write();
            if state.members.remove(member).is_none() {
                return Err(BrokerError::NotMember {
                    group: group.to_string(),
                    member: member.to_string(),
                });
            }
            tracing::info!(group, member, "member left");
            self.rebalance_locked(&handle, &mut state)?
        };
        self.wake_all(&wake);
        Ok(())
    }

    /// Recompute the assignment of `group` now.
    pub fn rebalance(&self, group: &str) -> Result<u64, BrokerError> {
        let handle = self.group(group)?;
        let (wake, generation) = {
            let mut state = handle.state.write();
            let wake = self.rebalance_locked(&handle, &mut state)?;
            (wake, state.generation)
        };
        self.wake_all(&wake);
        Ok(generation)
    }

    /// Stable -> Rebalancing -> Stable under the group write lock.
    ///
    /// Leases on every partition that changes owner are returned to the
    /// ready pool before the new assignment is published. Returns the
    /// partitions whose waiters should be woken once the lock is released.
    fn rebalance_locked(
        &self,
        group: &ConsumerGroup,
        state: &mut GroupState,
    ) -> Result<Vec<TopicPartition>, BrokerError> {
        state.phase = GroupPhase::Rebalancing;

        let partitions: BTreeMap<String, u32> = state
            .topics()
            .into_iter()
            .filter_map(|t| self.topics.resolve_partitions(&t).map(|n| (t, n)))
            .collect();
        let next = assign(&state.members, &partitions, &state.assignment);

        let mut revoked = 0;
        let mut touched: BTreeSet<TopicPartition> = state.assignment.keys().cloned().collect();
        for (tp, owner) in &state.assignment {
            if next.get(tp) != Some(owner) {
                if let Some(cursor) = group.cursor(tp) {
                    revoked += cursor.lock().revoke_all();
                }
            }
        }
        touched.extend(next.keys().cloned());

        state.assignment = next;
        state.generation += 1;

        let mut result = Ok(());
        for tp in state.assignment.keys() {
            if let Err(e) = self.cursor_for(group, state.start, tp) {
                tracing::warn!(group = %group.name, %tp, error = %e, "cursor not initialised");
                result = Err(e);
            }
        }
        state.phase = GroupPhase::Stable;

        self.metrics.record_rebalance(&group.name, state.generation);
        tracing::info!(
            group = %group.name,
            generation = state.generation,
            members = state.members.len(),
            partitions = state.assignment.len(),
            revoked,
            "rebalance complete"
        );
        result.map(|()| touched.into_iter().collect())
    }

    fn cursor_for(
        &self,
        group: &ConsumerGroup,
        start: StartPosition,
        tp: &TopicPartition,
    ) -> Result<Arc<Mutex<PartitionCursor>>, BrokerError> {
        if let Some(cursor) = group.cursor(tp) {
            return Ok(cursor);
        }
        let committed = self
            .restored
            .get(&group.name)
            .and_then(|m| m.get(tp))
            .copied();
        let begin = match (committed, start) {
            (Some(c), _) => c + 1,
            (None, StartPosition::Earliest) => self.log.earliest_offset(tp)?,
            (None, StartPosition::Latest) => self.log.high_water_mark(tp)?,
        };
        Ok(group.cursor_or_insert_with(tp, || PartitionCursor::new(committed, begin)))
    }

    pub fn heartbeat(&self, group: &str, member: &str) -> Result<(), BrokerError> {
        let handle = self.group(group)?;
        let state = handle.state.read();
        state
            .members
            .get(member)
            .ok_or_else(|| BrokerError::NotMember {
                group: group.to_string(),
                member: member.to_string(),
            })?
            .touch(self.now_ms());
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    //  Delivery
    // ───────────────────────────────────────────────────────────

    /// Lease up to `max` ready records from the partitions `member` owns,
    /// bounded by its prefetch. Partitions are visited round-robin.
    ///
    /// A partition that fails is skipped for the rest of the call. The error
    /// is returned only when every owned partition failed.
    pub fn poll(&self, group: &str, member: &str, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let handle = self.group(group)?;
        let Some(state) = handle.state.try_read() else {
            return Err(BrokerError::RebalanceInProgress(group.to_string()));
        };
        let Some(me) = state.members.get(member) else {
            return Err(BrokerError::NotMember {
                group: group.to_string(),
                member: member.to_string(),
            });
        };
        let now = self.now_ms();
        me.touch(now);

        let owned = state.owned_by(member);
        let total = owned.len();
        let mut failures = Vec::new();
        let mut cursors = Vec::new();
        let mut held = 0;
        for tp in owned {
            match self.cursor_for(&handle, state.start, &tp) {
                Ok(cursor) => {
                    {
                        let mut c = cursor.lock();
                        self.expire_locked(group, &tp, &mut c, now);
                        held += c.in_flight_count(member);
                    }
                    cursors.push((tp, cursor));
                }
                Err(e) => {
                    tracing::warn!(group, %tp, error = %e, "partition skipped");
                    failures.push(e);
                }
            }
        }

        let budget = me.prefetch.saturating_sub(held).min(max);
        let mut out = Vec::new();
        let mut drained = vec![false; cursors.len()];
        'rounds: while out.len() < budget {
            let mut progressed = false;
            for (i, (tp, cursor)) in cursors.iter().enumerate() {
                if out.len() >= budget {
                    break 'rounds;
                }
                if drained[i] {
                    continue;
                }
                match self.deliver_one(group, tp, cursor, member, now) {
                    Ok(Some(delivery)) => {
                        out.push(delivery);
                        progressed = true;
                    }
                    Ok(None) => drained[i] = true,
                    Err(e) => {
                        tracing::warn!(group, %tp, error = %e, "partition skipped");
                        drained[i] = true;
                        failures.push(e);
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        if out.is_empty() && total > 0 && failures.len() == total {
            if let Some(first) = failures.into_iter().next() {
                return Err(first);
            }
        }
        Ok(out)
    }

    fn deliver_one(
        &self,
        group: &str,
        tp: &TopicPartition,
        cursor: &Mutex<PartitionCursor>,
        member: &str,
        now: u64,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut c = cursor.lock();
        c.promote_deferred(now);
        loop {
            let selection = select(&mut c, &self.log, tp, now)?;
            for due in selection.deferred {
                self.schedule(due, group, tp);
            }
            let Some(record) = selection.record else {
                return Ok(None);
            };

            let max_attempts = attempt_limit(&record, self.config.dead_letter.max_attempts);
            if max_attempts > 0 && c.attempts(record.offset) >= max_attempts {
                self.dead_letter(group, tp, &mut c, record, now)?;
                continue;
            }

            let offset = record.offset;
            let lease = c
                .deliver_lease(offset, member, now, self.config.lease_timeout_ms)
                .map_err(|e| lease_error(e, tp, offset, member))?;
            self.schedule(lease.deadline_ms, group, tp);
            self.metrics.record_delivery(group, tp, lease.attempt);
            tracing::debug!(group, %tp, offset, member, attempt = lease.attempt, "delivered");
            return Ok(Some(Delivery {
                group: group.to_string(),
                tp: tp.clone(),
                record,
                attempt: lease.attempt,
                lease_expires_at_ms: lease.deadline_ms,
            }));
        }
    }

    fn expire_locked(&self, group: &str, tp: &TopicPartition, cursor: &mut PartitionCursor, now: u64) -> usize {
        let expired = cursor.expire(now);
        for lease in &expired {
            self.metrics.record_lease_expired(group, tp, lease.offset);
            tracing::debug!(
                group,
                %tp,
                offset = lease.offset,
                member = %lease.member,
                attempt = lease.attempt,
                "lease expired"
            );
        }
        expired.len()
    }

    fn dead_letter(
        &self,
        group: &str,
        tp: &TopicPartition,
        cursor: &mut PartitionCursor,
        record: Record,
        now: u64,
    ) -> Result<(), BrokerError> {
        let offset = record.offset;
        let attempts = cursor.attempts(offset);
        let plan = cursor
            .settle_plan(offset)
            .map_err(|e| lease_error(e, tp, offset, "dead-letter"))?;

        let target = self.config.dead_letter.topic_for(&tp.topic).filter(|dlq| {
            match validate_topic_name(dlq) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(group, %tp, offset, dlq = %dlq, error = %e, "invalid dead-letter topic");
                    false
                }
            }
        });
        match target {
            None => {
                tracing::warn!(group, %tp, offset, attempts, "dropping record after max delivery attempts");
            }
            Some(dlq) => {
                self.open_topic(&dlq, 1)?;
                let mut copy = NewRecord {
                    timestamp_ms: now,
                    deliver_at_ms: None,
                    key: record.key,
                    headers: record.headers,
                    payload: record.payload,
                };
                copy.headers.insert(HEADER_ORIGINAL_TOPIC.into(), tp.topic.clone());
                copy.headers.insert(HEADER_ORIGINAL_PARTITION.into(), tp.partition.to_string());
                copy.headers.insert(HEADER_ORIGINAL_OFFSET.into(), offset.to_string());
                copy.headers.insert(HEADER_ATTEMPTS.into(), attempts.to_string());
                copy.headers.insert(HEADER_GROUP.into(), group.to_string());
                let published = self.publish(&dlq, copy)?;
                tracing::warn!(
                    group,
                    %tp,
                    offset,
                    attempts,
                    dlq = %published.tp,
                    dlq_offset = published.offset,
                    "moved record to dead-letter topic"
                );
            }
        }

        self.commit_plan(group, tp, cursor, plan)?;
        self.metrics.record_dead_letter(group, tp, offset);
        Ok(())
    }

    /// Persist the committed offset (if it moves), then apply the ack.
    fn commit_plan(
        &self,
        group: &str,
        tp: &TopicPartition,
        cursor: &mut PartitionCursor,
        plan: AckPlan,
    ) -> Result<Option<u64>, BrokerError> {
        if let Some(to) = plan.advance_to {
            self.cursor_store
                .commit(group, tp, to)
                .map_err(|e| BrokerError::from(e).with_context(format!("commit {group} {tp}")))?;
        }
        cursor.apply_ack(plan);
        Ok(cursor.committed())
    }

    fn owned_cursor(
        &self,
        handle: &ConsumerGroup,
        state: &GroupState,
        member: &str,
        tp: &TopicPartition,
    ) -> Result<Arc<Mutex<PartitionCursor>>, BrokerError> {
        let me = state.members.get(member).ok_or_else(|| BrokerError::NotMember {
            group: handle.name.clone(),
            member: member.to_string(),
        })?;
        me.touch(self.now_ms());
        if state.assignment.get(tp).map(String::as_str) != Some(member) {
            return Err(BrokerError::NotOwner {
                group: handle.name.clone(),
                tp: tp.clone(),
                member: member.to_string(),
            });
        }
        self.cursor_for(handle, state.start, tp)
    }

    /// Acknowledge `offset`. Returns the committed offset afterwards.
    ///
    /// When the ack moves the committed offset, the new value is durable
    /// before this returns. If persisting fails the lease is left untouched.
    pub fn ack(
        &self,
        group: &str,
        member: &str,
        tp: &TopicPartition,
        offset: u64,
    ) -> Result<Option<u64>, BrokerError> {
        let handle = self.group(group)?;
        let state = handle.state.read();
        let cursor = self.owned_cursor(&handle, &state, member, tp)?;
        let mut c = cursor.lock();
        let plan = c
            .ack_plan(offset, member)
            .map_err(|e| lease_error(e, tp, offset, member))?;
        let committed = self.commit_plan(group, tp, &mut c, plan)?;
        drop(c);
        drop(state);

        self.metrics.record_ack(group, tp, committed);
        tracing::debug!(group, %tp, offset, member, ?committed, "acked");
        Ok(committed)
    }

    /// Return `offset` for immediate redelivery.
    pub fn nack(&self, group: &str, member: &str, tp: &TopicPartition, offset: u64) -> Result<(), BrokerError> {
        let handle = self.group(group)?;
        {
            let state = handle.state.read();
            let cursor = self.owned_cursor(&handle, &state, member, tp)?;
            cursor
                .lock()
                .nack(offset, member)
                .map_err(|e| lease_error(e, tp, offset, member))?;
        }
        self.metrics.record_nack(group, tp);
        tracing::debug!(group, %tp, offset, member, "nacked");
        self.waiters.wake(tp);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    //  Timers and sweeping
    // ───────────────────────────────────────────────────────────

    fn schedule(&self, due_ms: u64, group: &str, tp: &TopicPartition) {
        if self.timers.lock().push(due_ms, group, tp) {
            self.timer_changed.notify_one();
        }
    }

    /// Earliest pending lease deadline or delivery time.
    pub fn next_timer_due(&self) -> Option<u64> {
        self.timers.lock().next_due()
    }

    /// Signalled when a timer earlier than every pending one is added.
    pub fn timer_changed(&self) -> &Notify {
        &self.timer_changed
    }

    /// Expire due leases, release due delayed records and evict members
    /// that stopped heartbeating. Wakes the affected waiters.
    pub fn sweep(&self) -> SweepReport {
        let now = self.now_ms();
        let mut report = SweepReport::default();

        let due = self.timers.lock().pop_due(now);
        for (group, tp) in due {
            let handle = self.groups.read().get(&group).cloned();
            if let Some(cursor) = handle.and_then(|h| h.cursor(&tp)) {
                let mut c = cursor.lock();
                report.expired += self.expire_locked(&group, &tp, &mut c, now);
                report.promoted += c.promote_deferred(now);
            }
            self.waiters.wake(&tp);
        }

        report.evicted = self.evict_dead_members(now);
        if report != SweepReport::default() {
            tracing::debug!(
                expired = report.expired,
                promoted = report.promoted,
                evicted = report.evicted,
                "sweep"
            );
        }
        report
    }

    fn evict_dead_members(&self, now: u64) -> usize {
        let timeout = self.config.session_timeout_ms;
        let is_dead = |m: &MemberState| now.saturating_sub(m.last_heartbeat_ms()) > timeout;

        let groups: Vec<Arc<ConsumerGroup>> = self.groups.read().values().cloned().collect();
        let mut evicted = 0;
        for handle in groups {
            let dead: Vec<MemberId> = handle
                .state
                .read()
                .members
                .iter()
                .filter(|(_, m)| is_dead(*m))
                .map(|(id, _)| id.clone())
                .collect();
            if dead.is_empty() {
                continue;
            }

            let wake = {
                let mut state = handle.state.write();
                for id in &dead {
                    if state.members.get(id).is_some_and(|m| is_dead(m)) {
                        state.members.remove(id);
                        evicted += 1;
                        tracing::warn!(group = %handle.name, member = %id, "evicting member after missed heartbeats");
                    }
                }
                self.rebalance_locked(&handle, &mut state)
            };
            match wake {
                Ok(tps) => self.wake_all(&tps),
                Err(e) => tracing::warn!(group = %handle.name, error = %e, "rebalance after eviction incomplete"),
            }
        }
        evicted
    }

    fn wake_all(&self, tps: &[TopicPartition]) {
        for tp in tps {
            self.waiters.wake(tp);
        }
    }

    /// Register interest in new work on `tps`.
    pub fn wait_handle(&self, tps: &[TopicPartition]) -> WaitHandle {
        self.waiters.register(tps)
    }

    // ───────────────────────────────────────────────────────────
    //  Retention
    // ───────────────────────────────────────────────────────────

    /// Lowest offset some group still needs on `tp`.
    fn group_floor(&self, tp: &TopicPartition) -> Option<u64> {
        let groups = self.groups.read();
        let mut floor: Option<u64> = None;
        let mut lower = |f: u64| floor = Some(floor.map_or(f, |cur| cur.min(f)));

        for handle in groups.values() {
            if let Some(cursor) = handle.cursor(tp) {
                lower(cursor.lock().floor());
            }
        }
        for (group, cursors) in &self.restored {
            let live = groups.get(group).and_then(|h| h.cursor(tp)).is_some();
            if let (false, Some(c)) = (live, cursors.get(tp)) {
                lower(c + 1);
            }
        }
        floor
    }

    /// Drop records below `offset`, refused while a group still needs them.
    pub fn truncate_before(&self, tp: &TopicPartition, offset: u64) -> Result<TruncateOutcome, BrokerError> {
        self.log.truncate_before(tp, offset, self.group_floor(tp))
    }

    /// Apply the age and size limits of the retention config to every
    /// partition, never past what a group still needs.
    pub fn apply_retention(&self) -> Vec<(TopicPartition, TruncateOutcome)> {
        let retention = &self.config.retention;
        if !retention.enabled() {
            return Vec::new();
        }
        let now = self.now_ms();
        let mut out = Vec::new();
        for tp in self.log.partitions() {
            if !self.log.is_online(&tp) {
                continue;
            }
            match self.retain_partition(&tp, now) {
                Ok(Some(outcome)) => out.push((tp, outcome)),
                Ok(None) => {}
                Err(e) => tracing::warn!(%tp, error = %e, "retention skipped"),
            }
        }
        out
    }

    fn retain_partition(&self, tp: &TopicPartition, now: u64) -> Result<Option<TruncateOutcome>, BrokerError> {
        let retention = &self.config.retention;
        let earliest = self.log.earliest_offset(tp)?;
        let hwm = self.log.high_water_mark(tp)?;
        let floor = self.group_floor(tp);
        let limit = floor.map_or(hwm, |f| f.min(hwm));

        let mut boundary = earliest;
        if let Some(max) = retention.max_records {
            boundary = boundary.max(hwm.saturating_sub(max));
        }
        if let Some(max_age) = retention.max_age_ms {
            let cutoff = now.saturating_sub(max_age);
            let mut first_young = limit;
            for record in self.log.reader(tp, boundary)? {
                let record = record?;
                if record.offset >= limit || record.timestamp_ms >= cutoff {
                    first_young = record.offset.min(limit);
                    break;
                }
            }
            boundary = boundary.max(first_young);
        }

        let boundary = boundary.min(limit);
        if boundary <= earliest {
            return Ok(None);
        }
        self.log.truncate_before(tp, boundary, floor).map(Some)
    }

    // ───────────────────────────────────────────────────────────
    //  Inspection
    // ───────────────────────────────────────────────────────────

    pub fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<u64> {
        let live = self.groups.read().get(group).and_then(|h| h.cursor(tp));
        match live {
            Some(cursor) => cursor.lock().committed(),
            None => self.restored.get(group).and_then(|m| m.get(tp)).copied(),
        }
    }

    pub fn describe_group(&self, group: &str) -> Result<GroupDescription, BrokerError> {
        let handle = self.group(group)?;
        let state = handle.state.read();
        let members = state
            .members
            .iter()
            .map(|(id, m)| MemberDescription {
                id: id.clone(),
                topics: m.topics.iter().cloned().collect(),
                prefetch: m.prefetch,
                last_heartbeat_ms: m.last_heartbeat_ms(),
                partitions: state.owned_by(id),
            })
            .collect();
        let partitions = handle
            .cursors()
            .into_iter()
            .map(|(tp, cursor)| {
                let c = cursor.lock();
                PartitionDescription {
                    owner: state.assignment.get(&tp).cloned(),
                    committed: c.committed(),
                    in_flight: c.in_flight_total(),
                    tp,
                }
            })
            .collect();
        Ok(GroupDescription {
            name: handle.name.clone(),
            phase: state.phase,
            generation: state.generation,
            members,
            partitions,
        })
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn high_water_mark(&self, tp: &TopicPartition) -> Result<u64, BrokerError> {
        self.log.high_water_mark(tp)
    }

    pub fn read(&self, tp: &TopicPartition, from: u64, max: usize) -> Result<Vec<Record>, BrokerError> {
        self.log.read(tp, from, max)
    }

    /// Flush logs and the cursor store.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.log.flush_all()?;
        self.cursor_store.flush()?;
        Ok(())
    }
}

/// `x-max-attempts` when present and numeric, else `default`. 0 is unlimited.
fn attempt_limit(record: &Record, default: u32) -> u32 {
    record
        .headers
        .get(HEADER_MAX_ATTEMPTS)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn lease_error(e: LeaseError, tp: &TopicPartition, offset: u64, member: &str) -> BrokerError {
    match e {
        LeaseError::AlreadyLeased => BrokerError::AlreadyLeased { tp: tp.clone(), offset },
        LeaseError::AlreadySettled => BrokerError::AlreadySettled { tp: tp.clone(), offset },
        LeaseError::InvalidLease => BrokerError::InvalidLease {
            tp: tp.clone(),
            offset,
            member: member.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmq_api::{ManualClock, NoopMetrics};
    use vmq_storage_memory::MemoryStorage;

    #[test]
    fn poll_during_rebalance_grants_no_lease() {
        let broker = Broker::open(
            BrokerConfig::default(),
            Arc::new(MemoryStorage::default()),
            Arc::new(ManualClock::new(0)),
            Arc::new(NoopMetrics),
        )
        .unwrap();
        let tp = TopicPartition::new("t", 0);
        broker.publish("t", NewRecord::new(b"x".to_vec())).unwrap();
        broker
            .subscribe_group("g", "m", &["t".to_string()], None, None)
            .unwrap();

        let handle = broker.group("g").unwrap();
        {
            let _rebalancing = handle.state.write();
            assert!(matches!(
                broker.poll("g", "m", 10),
                Err(BrokerError::RebalanceInProgress(_))
            ));
            let leased = handle.cursor(&tp).map_or(0, |c| c.lock().in_flight_total());
            assert_eq!(leased, 0);
        }
        assert_eq!(broker.poll("g", "m", 10).unwrap().len(), 1);
    }
}
