//! Piggybacking coordination between the broadcast queue and the table.
//!
//! Outbound, it drains the queue into per-message payloads under a transmit
//! budget. Inbound, it applies received updates to the table and re-queues
//! every accepted one so the infection keeps spreading.

use crate::member::Member;
use crate::membership::broadcast::BroadcastQueue;
use crate::membership::table::{Change, MembershipTable};
use crate::message::GossipPayload;

#[derive(Debug, Default)]
pub struct Disseminator {
    queue: BroadcastQueue,
}

impl Disseminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a locally originated update for gossip.
    pub fn enqueue(&mut self, member: Member) {
        self.queue.push(member);
    }

    /// Number of updates still waiting to be disseminated.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Build the payload for one outgoing message: select up to
    /// `max_payload` updates by priority, charge each one transmit, and
    /// retire entries that exhausted the `limit`. An empty queue yields an
    /// empty payload.
    pub fn payload_for_message(&mut self, max_payload: usize, limit: u32) -> GossipPayload {
        let selected = self.queue.peek(max_payload);
        if selected.is_empty() {
            return Vec::new();
        }

        let ids: Vec<_> = selected.iter().map(|m| m.id.clone()).collect();
        self.queue.increment_counters(&ids);
        self.queue.remove_expired(limit);
        selected
    }

    /// Apply a received payload to the table. Accepted updates re-enter the
    /// queue; the returned changes are those that altered observable state.
    pub fn ingest(
        &mut self,
        payload: GossipPayload,
        table: &mut MembershipTable,
    ) -> Vec<Change> {
        let mut changes = Vec::new();
        for update in payload {
            let applied = table.apply(update.clone());
            if applied.accepted {
                self.queue.push(update);
            }
            if let Some(change) = applied.change {
                changes.push(change);
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{MemberId, Status};

    fn member(n: &str, status: Status, incarnation: u64) -> Member {
        Member::new(MemberId::new(n, format!("{}:7946", n)), status, incarnation)
    }

    #[test]
    fn payload_respects_budget_and_expires_entries() {
        let mut disseminator = Disseminator::new();
        for n in ["a", "b", "c"] {
            disseminator.enqueue(member(n, Status::Alive, 0));
        }

        let payload = disseminator.payload_for_message(2, 2);
        assert_eq!(payload.len(), 2);
        assert_eq!(disseminator.backlog(), 3, "one transmit left for each");

        // Two more messages charge the remaining budget; nothing lingers.
        disseminator.payload_for_message(3, 2);
        disseminator.payload_for_message(3, 2);
        let last = disseminator.payload_for_message(3, 2);
        assert!(disseminator.backlog() <= 1);
        assert!(last.len() <= 1);
    }

    #[test]
    fn empty_queue_yields_empty_payload() {
        let mut disseminator = Disseminator::new();
        assert!(disseminator.payload_for_message(10, 3).is_empty());
    }

    #[test]
    fn accepted_updates_requeue_for_further_spread() {
        let mut disseminator = Disseminator::new();
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 1));

        let changes = disseminator.ingest(
            vec![
                member("a", Status::Suspect, 1), // severity wins: accepted
                member("a", Status::Alive, 0),   // stale: rejected
                member("b", Status::Alive, 0),   // fresh member: accepted
            ],
            &mut table,
        );

        assert_eq!(changes.len(), 2);
        assert_eq!(disseminator.backlog(), 2, "both accepted updates queued");
        assert_eq!(table.get(&member("a", Status::Alive, 0).id).unwrap().status, Status::Suspect);
    }

    #[test]
    fn silent_incarnation_bump_still_requeues() {
        let mut disseminator = Disseminator::new();
        let mut table = MembershipTable::new();
        table.upsert(member("a", Status::Alive, 1));

        let changes = disseminator.ingest(vec![member("a", Status::Alive, 2)], &mut table);

        assert!(changes.is_empty(), "no observable change");
        assert_eq!(disseminator.backlog(), 1, "accepted update still spreads");
    }
}
