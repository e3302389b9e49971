use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type MemberId = String;

/// Claim of one member on one delivered, unacknowledged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub member: MemberId,
    pub offset: u64,
    pub deadline_ms: u64,
    /// Delivery attempt this lease represents, starting at 1.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    AlreadyLeased,
    InvalidLease,
    AlreadySettled,
}

/// Outcome of validating an ack, computed before anything is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPlan {
    pub offset: u64,
    /// New committed offset when the ack closes a contiguous run.
    pub advance_to: Option<u64>,
}

/// Delivery state of one consumer group on one partition.
///
/// Offsets below `floor()` are settled. Above it every offset is in exactly
/// one of: never delivered (`>= next_fresh`), leased (`in_flight`), acked out
/// of order (`acked`), waiting for redelivery (`ready`) or parked until its
/// delivery time (`deferred`).
#[derive(Debug, Clone, Default)]
pub struct PartitionCursor {
    committed: Option<u64>,
    start: u64,
    next_fresh: u64,
    in_flight: BTreeMap<u64, Lease>,
    acked: BTreeSet<u64>,
    /// Redeliverable offsets. The value is the member whose lease expired,
    /// which may still ack until someone else takes the offset.
    ready: BTreeMap<u64, Option<MemberId>>,
    /// offset -> delivery time.
    deferred: BTreeMap<u64, u64>,
    attempts: HashMap<u64, u32>,
}

impl PartitionCursor {
    /// `committed` is the durable cursor, `start` where to begin without one.
    pub fn new(committed: Option<u64>, start: u64) -> Self {
        let mut cursor = Self {
            committed,
            start,
            ..Default::default()
        };
        cursor.next_fresh = cursor.floor();
        cursor
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// Lowest offset not yet settled.
    pub fn floor(&self) -> u64 {
        self.committed.map_or(0, |c| c + 1).max(self.start)
    }

    /// Lowest offset never handed out.
    pub fn next_fresh(&self) -> u64 {
        self.next_fresh
    }

    pub fn lease(&self, offset: u64) -> Option<&Lease> {
        self.in_flight.get(&offset)
    }

    pub fn in_flight_count(&self, member: &str) -> usize {
        self.in_flight.values().filter(|l| l.member == member).count()
    }

    pub fn in_flight_total(&self) -> usize {
        self.in_flight.len()
    }

    pub fn attempts(&self, offset: u64) -> u32 {
        self.attempts.get(&offset).copied().unwrap_or(0)
    }

    /// Lowest redeliverable offset.
    pub fn next_ready(&self) -> Option<u64> {
        self.ready.keys().next().copied()
    }

    /// Forget everything below `earliest` after the log dropped it.
    pub fn skip_to(&mut self, earliest: u64) {
        if self.floor() >= earliest {
            return;
        }
        self.start = earliest;
        self.next_fresh = self.next_fresh.max(earliest);
        self.in_flight = self.in_flight.split_off(&earliest);
        self.ready = self.ready.split_off(&earliest);
        self.deferred = self.deferred.split_off(&earliest);
        self.acked = self.acked.split_off(&earliest);
        self.attempts.retain(|offset, _| *offset >= earliest);
    }

    /// Park the next fresh offset until `due_ms`.
    pub fn defer(&mut self, offset: u64, due_ms: u64) {
        debug_assert_eq!(offset, self.next_fresh);
        self.deferred.insert(offset, due_ms);
        self.next_fresh = self.next_fresh.max(offset + 1);
    }

    /// Move deferred offsets whose time has come into the ready pool.
    pub fn promote_deferred(&mut self, now_ms: u64) -> usize {
        let due: Vec<u64> = self
            .deferred
            .iter()
            .filter(|(_, at)| **at <= now_ms)
            .map(|(offset, _)| *offset)
            .collect();
        for offset in &due {
            self.deferred.remove(offset);
            self.ready.insert(*offset, None);
        }
        due.len()
    }

    /// Return every lease past its deadline to the ready pool.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Lease> {
        let expired: Vec<u64> = self
            .in_flight
            .values()
            .filter(|l| l.deadline_ms <= now_ms)
            .map(|l| l.offset)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for offset in expired {
            if let Some(lease) = self.in_flight.remove(&offset) {
                self.ready.insert(offset, Some(lease.member.clone()));
                out.push(lease);
            }
        }
        out
    }

    /// Lease `offset` to `member`. Only ready offsets and the next fresh
    /// offset can be leased.
    pub fn deliver_lease(
        &mut self,
        offset: u64,
        member: &str,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Result<Lease, LeaseError> {
        if offset < self.floor() || self.acked.contains(&offset) {
            return Err(LeaseError::AlreadySettled);
        }
        if let Some(lease) = self.in_flight.get(&offset) {
            if lease.deadline_ms > now_ms {
                return Err(LeaseError::AlreadyLeased);
            }
            self.in_flight.remove(&offset);
        } else if self.ready.remove(&offset).is_none() {
            if offset != self.next_fresh {
                return Err(LeaseError::InvalidLease);
            }
            self.next_fresh += 1;
        }

        let attempt = self.attempts.entry(offset).or_default();
        *attempt += 1;
        let lease = Lease {
            member: member.to_string(),
            offset,
            deadline_ms: now_ms.saturating_add(timeout_ms),
            attempt: *attempt,
        };
        self.in_flight.insert(offset, lease.clone());
        Ok(lease)
    }

    fn check_unsettled(&self, offset: u64) -> Result<(), LeaseError> {
        if offset < self.floor() || self.acked.contains(&offset) {
            return Err(LeaseError::AlreadySettled);
        }
        Ok(())
    }

    fn holds(&self, offset: u64, member: &str) -> bool {
        match self.in_flight.get(&offset) {
            Some(lease) => lease.member == member,
            None => matches!(self.ready.get(&offset), Some(Some(m)) if m == member),
        }
    }

    fn plan(&self, offset: u64) -> AckPlan {
        let mut advance_to = None;
        if offset == self.floor() {
            let mut end = offset;
            while self.acked.contains(&(end + 1)) {
                end += 1;
            }
            advance_to = Some(end);
        }
        AckPlan { offset, advance_to }
    }

    /// Validate an ack by `member`. Nothing changes until `apply_ack`.
    pub fn ack_plan(&self, offset: u64, member: &str) -> Result<AckPlan, LeaseError> {
        self.check_unsettled(offset)?;
        if !self.holds(offset, member) {
            return Err(LeaseError::InvalidLease);
        }
        Ok(self.plan(offset))
    }

    /// Settle an offset regardless of who holds it (dead-lettering).
    pub fn settle_plan(&self, offset: u64) -> Result<AckPlan, LeaseError> {
        self.check_unsettled(offset)?;
        Ok(self.plan(offset))
    }

    pub fn apply_ack(&mut self, plan: AckPlan) {
        self.in_flight.remove(&plan.offset);
        self.ready.remove(&plan.offset);
        self.deferred.remove(&plan.offset);
        self.attempts.remove(&plan.offset);
        match plan.advance_to {
            Some(end) => {
                self.acked = self.acked.split_off(&(end + 1));
                for offset in plan.offset..=end {
                    self.attempts.remove(&offset);
                }
                self.committed = Some(end);
                self.next_fresh = self.next_fresh.max(end + 1);
            }
            None => {
                self.acked.insert(plan.offset);
            }
        }
    }

    /// Give a leased offset back for immediate redelivery.
    pub fn nack(&mut self, offset: u64, member: &str) -> Result<(), LeaseError> {
        self.check_unsettled(offset)?;
        if !self.holds(offset, member) {
            return Err(LeaseError::InvalidLease);
        }
        self.in_flight.remove(&offset);
        self.ready.insert(offset, None);
        Ok(())
    }

    /// Return every lease to the ready pool (the partition changes owner).
    pub fn revoke_all(&mut self) -> usize {
        let revoked = std::mem::take(&mut self.in_flight);
        let count = revoked.len();
        for offset in revoked.into_keys() {
            self.ready.insert(offset, None);
        }
        for holder in self.ready.values_mut() {
            *holder = None;
        }
        count
    }
}
