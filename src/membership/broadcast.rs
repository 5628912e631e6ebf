//! Priority queue of membership updates awaiting dissemination.
//!
//! Holds at most one pending update per member. Ranking favours severe
//! statuses, then updates that have been transmitted the fewest times, then
//! higher incarnations.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::member::{Member, MemberId};

/// A queued gossip update with its transmit counter. The counter is local
/// bookkeeping and never reaches the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub member: Member,
    pub transmits: u32,
}

#[derive(Debug, Default)]
pub struct BroadcastQueue {
    entries: IndexMap<MemberId, MembershipUpdate>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an update. An existing entry for the same member is replaced
    /// only when the incoming update dominates it: a strictly greater
    /// incarnation, or a more severe status at an equal incarnation.
    pub fn push(&mut self, member: Member) {
        match self.entries.get_mut(&member.id) {
            None => {
                self.entries.insert(
                    member.id.clone(),
                    MembershipUpdate {
                        member,
                        transmits: 0,
                    },
                );
            }
            Some(existing) => {
                let dominates = member.incarnation > existing.member.incarnation
                    || (member.incarnation == existing.member.incarnation
                        && member.status > existing.member.status);
                if dominates {
                    *existing = MembershipUpdate {
                        member,
                        transmits: 0,
                    };
                }
            }
        }
    }

    /// Up to `k` updates in priority order, without mutating the queue.
    pub fn peek(&self, k: usize) -> Vec<Member> {
        let mut ranked: Vec<&MembershipUpdate> = self.entries.values().collect();
        ranked.sort_by(|a, b| Self::priority(a, b));
        ranked
            .into_iter()
            .take(k)
            .map(|update| update.member.clone())
            .collect()
    }

    /// Bump the transmit counter of each named entry.
    pub fn increment_counters(&mut self, ids: &[MemberId]) {
        for id in ids {
            if let Some(update) = self.entries.get_mut(id) {
                update.transmits += 1;
            }
        }
    }

    /// Drop every entry whose counter reached the dissemination limit.
    pub fn remove_expired(&mut self, limit: u32) {
        self.entries.retain(|_, update| update.transmits < limit);
    }

    pub fn remove(&mut self, id: &MemberId) {
        self.entries.swap_remove(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &MemberId) -> Option<&MembershipUpdate> {
        self.entries.get(id)
    }

    fn priority(a: &MembershipUpdate, b: &MembershipUpdate) -> Ordering {
        b.member
            .status
            .cmp(&a.member.status)
            .then(a.transmits.cmp(&b.transmits))
            .then(b.member.incarnation.cmp(&a.member.incarnation))
    }
}
