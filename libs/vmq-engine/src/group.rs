use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use vmq_api::{StartPosition, TopicPartition};

use crate::tracker::{MemberId, PartitionCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Stable,
    Rebalancing,
}

#[derive(Debug)]
pub struct MemberState {
    pub topics: BTreeSet<String>,
    pub prefetch: usize,
    last_heartbeat_ms: AtomicU64,
}

impl MemberState {
    pub fn new(topics: BTreeSet<String>, prefetch: usize, now_ms: u64) -> Self {
        Self {
            topics,
            prefetch,
            last_heartbeat_ms: AtomicU64::new(now_ms),
        }
    }

    /// Record liveness. Only needs a shared borrow of the group state.
    pub fn touch(&self, now_ms: u64) {
        self.last_heartbeat_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct GroupState {
    pub phase: GroupPhase,
    pub generation: u64,
    pub start: StartPosition,
    pub members: BTreeMap<MemberId, MemberState>,
    /// Partition -> owning member. At most one owner per partition.
    pub assignment: BTreeMap<TopicPartition, MemberId>,
}

impl GroupState {
    pub fn owned_by(&self, member: &str) -> Vec<TopicPartition> {
        self.assignment
            .iter()
            .filter(|(_, owner)| owner.as_str() == member)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    /// Union of the members' topics.
    pub fn topics(&self) -> BTreeSet<String> {
        self.members.values().flat_map(|m| m.topics.iter().cloned()).collect()
    }
}

/// A consumer group: membership and assignment behind a group-wide lock,
/// plus one independently locked cursor per partition.
pub struct ConsumerGroup {
    pub name: String,
    pub(crate) state: RwLock<GroupState>,
    cursors: Mutex<HashMap<TopicPartition, Arc<Mutex<PartitionCursor>>>>,
}

impl ConsumerGroup {
    pub fn new(name: &str, start: StartPosition) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(GroupState {
                phase: GroupPhase::Stable,
                generation: 0,
                start,
                members: BTreeMap::new(),
                assignment: BTreeMap::new(),
            }),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn cursor(&self, tp: &TopicPartition) -> Option<Arc<Mutex<PartitionCursor>>> {
        self.cursors.lock().get(tp).cloned()
    }

    /// The cursor for `tp`, built with `init` the first time it is needed.
    pub fn cursor_or_insert_with(
        &self,
        tp: &TopicPartition,
        init: impl FnOnce() -> PartitionCursor,
    ) -> Arc<Mutex<PartitionCursor>> {
        self.cursors
            .lock()
            .entry(tp.clone())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub fn cursors(&self) -> Vec<(TopicPartition, Arc<Mutex<PartitionCursor>>)> {
        let mut out: Vec<_> = self
            .cursors
            .lock()
            .iter()
            .map(|(tp, c)| (tp.clone(), c.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Deterministic, sticky assignment of partitions to members.
///
/// Per topic, subscribed members are taken in id order and given a fair
/// quota (`n / m`, the first `n % m` members one more). A partition stays
/// with its current owner while that owner is under quota; the rest go to
/// the least loaded member, ties broken by id.
pub fn assign(
    members: &BTreeMap<MemberId, MemberState>,
    partitions: &BTreeMap<String, u32>,
    current: &BTreeMap<TopicPartition, MemberId>,
) -> BTreeMap<TopicPartition, MemberId> {
    let mut out = BTreeMap::new();
    for (topic, &count) in partitions {
        let subscribers: Vec<&MemberId> = members
            .iter()
            .filter(|(_, m)| m.topics.contains(topic))
            .map(|(id, _)| id)
            .collect();
        if subscribers.is_empty() || count == 0 {
            continue;
        }

        let n = count as usize;
        let m = subscribers.len();
        let quota: HashMap<&MemberId, usize> = subscribers
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, n / m + usize::from(i < n % m)))
            .collect();
        let mut load: HashMap<&MemberId, usize> = subscribers.iter().map(|id| (*id, 0)).collect();

        let mut unassigned = Vec::new();
        for p in 0..count {
            let tp = TopicPartition::new(topic.as_str(), p);
            let keep = current
                .get(&tp)
                .and_then(|owner| subscribers.iter().find(|id| **id == owner))
                .filter(|owner| load[*owner] < quota[*owner]);
            match keep {
                Some(owner) => {
                    *load.entry(*owner).or_default() += 1;
                    out.insert(tp, (*owner).clone());
                }
                None => unassigned.push(tp),
            }
        }

        for tp in unassigned {
            let target = subscribers
                .iter()
                .filter(|id| load[*id] < quota[*id])
                .min_by_key(|id| load[*id]);
            if let Some(owner) = target {
                *load.entry(*owner).or_default() += 1;
                out.insert(tp, (*owner).clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(layout: &[(&str, &[&str])]) -> BTreeMap<MemberId, MemberState> {
        layout.iter()
            .map(|(id, topics)| {
                (
                    id.to_string(),
                    MemberState::new(topics.iter().map(|t| t.to_string()).collect(), 10, 0),
                )
            })
            .collect()
    }

    fn owners(assignment: &BTreeMap<TopicPartition, MemberId>, topic: &str, n: u32) -> Vec<String> {
        (0..n)
            .map(|p| assignment.get(&TopicPartition::new(topic, p)).cloned().unwrap_or_default())
            .collect()
    }

    #[test]
    fn single_member_owns_everything() {
        let parts = BTreeMap::from([("t".to_string(), 3)]);
        let a = assign(&members(&[("a", &["t"])]), &parts, &BTreeMap::new());
        assert_eq!(owners(&a, "t", 3), vec!["a", "a", "a"]);
    }

    #[test]
    fn join_moves_only_what_it_must() {
        let parts = BTreeMap::from([("t".to_string(), 4)]);
        let before = assign(&members(&[("a", &["t"])]), &parts, &BTreeMap::new());
        let after = assign(&members(&[("a", &["t"]), ("b", &["t"])]), &parts, &before);
        assert_eq!(owners(&after, "t", 4), vec!["a", "a", "b", "b"]);

        // Same input, same output.
        assert_eq!(
            after,
            assign(&members(&[("a", &["t"]), ("b", &["t"])]), &parts, &before)
        );
    }

    #[test]
    fn leave_hands_partitions_to_survivors() {
        let parts = BTreeMap::from([("t".to_string(), 4)]);
        let current = assign(
            &members(&[("a", &["t"]), ("b", &["t"]), ("c", &["t"])]),
            &parts,
            &BTreeMap::new(),
        );
        let after = assign(&members(&[("a", &["t"]), ("c", &["t"])]), &parts, &current);
        for p in 0..4 {
            let tp = TopicPartition::new("t", p);
            if current[&tp] != "b" {
                assert_eq!(after[&tp], current[&tp], "partition {p} moved needlessly");
            }
        }
        assert!(after.values().all(|m| m != "b"));
        assert_eq!(after.len(), 4);
    }

    #[test]
    fn more_members_than_partitions() {
        let parts = BTreeMap::from([("t".to_string(), 1)]);
        let a = assign(&members(&[("a", &["t"]), ("b", &["t"])]), &parts, &BTreeMap::new());
        assert_eq!(owners(&a, "t", 1), vec!["a"]);
    }

    #[test]
    fn members_only_get_their_topics() {
        let parts = BTreeMap::from([("t".to_string(), 2), ("u".to_string(), 2)]);
        let a = assign(&members(&[("a", &["t"]), ("b", &["u"])]), &parts, &BTreeMap::new());
        assert_eq!(owners(&a, "t", 2), vec!["a", "a"]);
        assert_eq!(owners(&a, "u", 2), vec!["b", "b"]);
    }
}
