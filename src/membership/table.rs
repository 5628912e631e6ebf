//! The authoritative local membership table.
//!
//! One record per member, mutated only through incarnation-based conflict
//! resolution. Three status index sets partition the keyspace at all times
//! so random and round-robin selection never scan the full map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use rand::Rng;

use crate::member::{Member, MemberId, Status};

/// Observable effect of applying an update to the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// A previously unknown member was inserted.
    Joined(Member),
    /// An existing member changed status; the second field is the prior one.
    StatusChanged(Member, Status),
}

impl Change {
    pub fn member(&self) -> &Member {
        match self {
            Change::Joined(m) | Change::StatusChanged(m, _) => m,
        }
    }
}

/// Outcome of the conflict-resolution rules for one incoming record.
///
/// `accepted` means the stored record was overwritten; a pure incarnation
/// bump is accepted without producing a [`Change`].
#[derive(Debug)]
pub(crate) struct Applied {
    pub accepted: bool,
    pub change: Option<Change>,
}

#[derive(Debug, Default)]
pub struct MembershipTable {
    members: IndexMap<MemberId, Member>,
    alive: IndexSet<MemberId>,
    suspect: IndexSet<MemberId>,
    dead: IndexSet<MemberId>,
    dead_since: HashMap<MemberId, Instant>,
    rr_cursor: usize,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    /// Whether any member is routed through the given address.
    pub fn has_address(&self, address: &str) -> bool {
        self.find_by_address(address).is_some()
    }

    /// The member routed through the given address, if any.
    pub fn find_by_address(&self, address: &str) -> Option<&Member> {
        self.members.values().find(|m| m.id.address == address)
    }

    /// Apply an incoming record under the conflict-resolution rules:
    /// a higher incarnation always wins, a lower one is rejected, and at
    /// equal incarnations the higher-severity status wins.
    pub fn upsert(&mut self, incoming: Member) -> Option<Change> {
        self.apply(incoming).change
    }

    pub(crate) fn apply(&mut self, incoming: Member) -> Applied {
        let Some(current) = self.members.get(&incoming.id) else {
            self.index_for(incoming.status).insert(incoming.id.clone());
            if incoming.status == Status::Dead {
                self.dead_since.insert(incoming.id.clone(), Instant::now());
            }
            self.members.insert(incoming.id.clone(), incoming.clone());
            return Applied {
                accepted: true,
                change: Some(Change::Joined(incoming)),
            };
        };

        let wins = incoming.incarnation > current.incarnation
            || (incoming.incarnation == current.incarnation && incoming.status > current.status);
        if !wins {
            return Applied {
                accepted: false,
                change: None,
            };
        }

        let previous = current.status;
        self.store(incoming.clone(), previous);
        let change = (previous != incoming.status)
            .then(|| Change::StatusChanged(incoming, previous));
        Applied {
            accepted: true,
            change,
        }
    }

    /// Move an Alive member to Suspect. Succeeds only when the current
    /// record is Alive at exactly the observed incarnation.
    pub fn mark_suspect(
        &mut self,
        id: &MemberId,
        incarnation_observed: u64,
    ) -> Option<Change> {
        let current = self.members.get(id)?;
        if current.status != Status::Alive || current.incarnation != incarnation_observed {
            return None;
        }

        let updated = Member::new(id.clone(), Status::Suspect, incarnation_observed);
        self.store(updated.clone(), Status::Alive);
        Some(Change::StatusChanged(updated, Status::Alive))
    }

    /// Declare a member Dead. Succeeds when the stored incarnation does not
    /// exceed the observed one and the member is not already Dead; the
    /// stored incarnation takes the observed value.
    pub fn mark_dead(&mut self, id: &MemberId, incarnation_observed: u64) -> Option<Change> {
        let current = self.members.get(id)?;
        if current.status == Status::Dead || current.incarnation > incarnation_observed {
            return None;
        }

        let previous = current.status;
        let updated = Member::new(id.clone(), Status::Dead, incarnation_observed);
        self.store(updated.clone(), previous);
        Some(Change::StatusChanged(updated, previous))
    }

    /// Apply a refutation: the member is Alive at a strictly newer
    /// incarnation.
    pub fn mark_alive(&mut self, id: &MemberId, incarnation_new: u64) -> Option<Change> {
        let current = self.members.get(id)?;
        if incarnation_new <= current.incarnation {
            return None;
        }

        let previous = current.status;
        let updated = Member::new(id.clone(), Status::Alive, incarnation_new);
        self.store(updated.clone(), previous);
        (previous != Status::Alive).then(|| Change::StatusChanged(updated, previous))
    }

    pub fn remove(&mut self, id: &MemberId) {
        if self.members.swap_remove(id).is_some() {
            self.alive.swap_remove(id);
            self.suspect.swap_remove(id);
            self.dead.swap_remove(id);
            self.dead_since.remove(id);
        }
    }

    /// Up to `k` distinct random Alive members, never returning an excluded
    /// one.
    pub fn random_alive(&self, k: usize, excluding: &[MemberId]) -> Vec<Member> {
        let mut candidates: Vec<&MemberId> = self
            .alive
            .iter()
            .filter(|id| !excluding.contains(id))
            .collect();

        let mut rng = rand::rng();
        let mut selected = Vec::with_capacity(k.min(candidates.len()));
        while selected.len() < k && !candidates.is_empty() {
            let idx = rng.random_range(0..candidates.len());
            let id = candidates.swap_remove(idx);
            selected.push(self.members[id].clone());
        }
        selected
    }

    /// One random member whose status is Alive or Suspect.
    pub fn random_probable(&self, excluding: &[MemberId]) -> Option<Member> {
        let candidates: Vec<&MemberId> = self
            .alive
            .iter()
            .chain(self.suspect.iter())
            .filter(|id| !excluding.contains(id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let idx = rand::rng().random_range(0..candidates.len());
        Some(self.members[candidates[idx]].clone())
    }

    /// Next probe target over Alive plus Suspect members, cycling for
    /// fairness.
    pub fn next_round_robin(&mut self, excluding: &[MemberId]) -> Option<Member> {
        let candidates: Vec<&MemberId> = self
            .alive
            .iter()
            .chain(self.suspect.iter())
            .filter(|id| !excluding.contains(id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let picked = candidates[self.rr_cursor % candidates.len()].clone();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        self.members.get(&picked).cloned()
    }

    /// Drop Dead members older than the retention interval. Returns the
    /// removed identities.
    pub fn sweep_dead(&mut self, retention: Duration) -> Vec<MemberId> {
        let now = Instant::now();
        let expired: Vec<MemberId> = self
            .dead_since
            .iter()
            .filter(|(_, marked)| now.duration_since(**marked) >= retention)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.remove(id);
        }
        expired
    }

    fn store(&mut self, updated: Member, previous: Status) {
        if previous != updated.status {
            self.index_for(previous).swap_remove(&updated.id);
            self.index_for(updated.status).insert(updated.id.clone());
            if updated.status == Status::Dead {
                self.dead_since.insert(updated.id.clone(), Instant::now());
            } else if previous == Status::Dead {
                self.dead_since.remove(&updated.id);
            }
        }
        self.members.insert(updated.id.clone(), updated);
    }

    fn index_for(&mut self, status: Status) -> &mut IndexSet<MemberId> {
        match status {
            Status::Alive => &mut self.alive,
            Status::Suspect => &mut self.suspect,
            Status::Dead => &mut self.dead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: &str) -> MemberId {
        MemberId::new(n, format!("{}:7946", n))
    }

    fn member(n: &str, status: Status, incarnation: u64) -> Member {
        Member::new(id(n), status, incarnation)
    }

    fn assert_partition(table: &MembershipTable) {
        for (member_id, record) in &table.members {
            let expected = match record.status {
                Status::Alive => (&table.alive, [&table.suspect, &table.dead]),
                Status::Suspect => (&table.suspect, [&table.alive, &table.dead]),
                Status::Dead => (&table.dead, [&table.alive, &table.suspect]),
            };
            assert!(expected.0.contains(member_id));
            for other in expected.1 {
                assert!(!other.contains(member_id));
            }
        }
        assert_eq!(
            table.alive.len() + table.suspect.len() + table.dead.len(),
            table.members.len()
        );
    }

    #[test]
    fn fresh_member_reports_joined() {
        let mut table = MembershipTable::new();
        let change = table.upsert(member("a", Status::Alive, 0));
        assert_eq!(change, Some(Change::Joined(member("a", Status::Alive, 0))));
        assert_partition(&table);
    }

    #[test]
    fn higher_incarnation_always_wins() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Dead, 4));

        let change = table.upsert(member("a", Status::Alive, 5));
        assert_eq!(
            change,
            Some(Change::StatusChanged(
                member("a", Status::Alive, 5),
                Status::Dead
            ))
        );
        assert_partition(&table);
    }

    #[test]
    fn lower_incarnation_is_rejected() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 5));

        assert_eq!(table.upsert(member("a", Status::Dead, 4)), None);
        assert_eq!(table.get(&id("a")).unwrap().incarnation, 5);
    }

    #[test]
    fn dead_dominates_on_equal_incarnation() {
        let mut table = MembershipTable::new();
        table.upsert(member("m", Status::Alive, 7));

        let change = table.upsert(member("m", Status::Dead, 7));
        assert!(change.is_some(), "higher severity at equal incarnation wins");

        // The reverse direction must stay rejected.
        assert_eq!(table.upsert(member("m", Status::Alive, 7)), None);
        assert_eq!(table.get(&id("m")).unwrap().status, Status::Dead);
        assert_partition(&table);
    }

    #[test]
    fn delivery_order_does_not_change_the_winner() {
        let updates = [
            member("a", Status::Alive, 3),
            member("a", Status::Suspect, 3),
            member("a", Status::Alive, 4),
            member("a", Status::Dead, 2),
        ];

        let mut forward = MembershipTable::new();
        for u in updates.iter().cloned() {
            forward.upsert(u);
        }

        let mut reverse = MembershipTable::new();
        for u in updates.iter().rev().cloned() {
            reverse.upsert(u);
        }

        assert_eq!(forward.get(&id("a")), reverse.get(&id("a")));
        assert_eq!(forward.get(&id("a")).unwrap().incarnation, 4);
    }

    #[test]
    fn pure_incarnation_bump_is_silent() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 1));

        assert_eq!(table.upsert(member("a", Status::Alive, 2)), None);
        assert_eq!(table.get(&id("a")).unwrap().incarnation, 2);
    }

    #[test]
    fn mark_suspect_requires_alive_at_observed_incarnation() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 3));

        assert!(table.mark_suspect(&id("a"), 2).is_none(), "stale observation");
        assert!(table.mark_suspect(&id("a"), 3).is_some());
        assert!(table.mark_suspect(&id("a"), 3).is_none(), "already suspect");
        assert_partition(&table);
    }

    #[test]
    fn mark_dead_takes_observed_incarnation() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Suspect, 3));

        let change = table.mark_dead(&id("a"), 5);
        assert!(change.is_some());
        let record = table.get(&id("a")).unwrap();
        assert_eq!(record.status, Status::Dead);
        assert_eq!(record.incarnation, 5);

        assert!(table.mark_dead(&id("a"), 9).is_none(), "already dead");
    }

    #[test]
    fn mark_alive_needs_strictly_newer_incarnation() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Suspect, 3));

        assert!(table.mark_alive(&id("a"), 3).is_none());
        let change = table.mark_alive(&id("a"), 4);
        assert_eq!(
            change,
            Some(Change::StatusChanged(
                member("a", Status::Alive, 4),
                Status::Suspect
            ))
        );
        assert_partition(&table);
    }

    #[test]
    fn incarnation_overflow_does_not_crash() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, u64::MAX));

        // A wrapped incarnation loses to the pre-wrap record; the table
        // treats incarnations as plain integers and must simply not panic.
        table.upsert(member("a", Status::Dead, u64::MAX.wrapping_add(1)));
        assert_eq!(table.get(&id("a")).unwrap().incarnation, u64::MAX);
    }

    #[test]
    fn random_alive_honours_exclusions_and_k() {
        let mut table = MembershipTable::new();
        for n in ["a", "b", "c", "d"] {
            table.upsert(member(n, Status::Alive, 0));
        }
        table.upsert(member("s", Status::Suspect, 0));

        for _ in 0..50 {
            let picked = table.random_alive(2, &[id("a")]);
            assert_eq!(picked.len(), 2);
            for m in &picked {
                assert_ne!(m.id, id("a"));
                assert_ne!(m.id, id("s"), "suspect members are not alive");
            }
            assert_ne!(picked[0].id, picked[1].id, "selection is without replacement");
        }

        assert!(table.random_alive(10, &[]).len() == 4);
    }

    #[test]
    fn round_robin_cycles_over_probable_members() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 0));
        table.upsert(member("b", Status::Alive, 0));
        table.upsert(member("s", Status::Suspect, 0));
        table.upsert(member("d", Status::Dead, 0));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let picked = table.next_round_robin(&[]).unwrap();
            assert_ne!(picked.status, Status::Dead);
            seen.insert(picked.id.id.clone());
        }
        assert_eq!(seen.len(), 3, "each probable member probed once per cycle");

        assert!(table.next_round_robin(&[id("a"), id("b"), id("s")]).is_none());
    }

    #[test]
    fn sweep_dead_respects_retention() {
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 0));
        table.upsert(member("d", Status::Dead, 1));

        assert!(table.sweep_dead(Duration::from_secs(60)).is_empty());
        let removed = table.sweep_dead(Duration::ZERO);
        assert_eq!(removed, vec![id("d")]);
        assert!(table.get(&id("d")).is_none());
        assert_partition(&table);
    }
}
