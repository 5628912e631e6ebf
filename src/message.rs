//! Wire message variants exchanged between engines.
//!
//! Three of the four variants piggyback a gossip payload; `Nack` carries
//! none. The binary layout lives in [`crate::codec`].

use crate::member::{Member, MemberId};

/// Membership updates piggybacked on a message. Wire order is whatever
/// order the sender selected; dissemination counters never travel.
pub type GossipPayload = Vec<Member>;

/// The four SWIM datagram types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Direct liveness probe.
    Ping { seq: u64, payload: GossipPayload },
    /// Ask a third party to probe `target` on the sender's behalf.
    PingReq {
        seq: u64,
        target: MemberId,
        payload: GossipPayload,
    },
    /// Probe answer; `responder` is the member the ack vouches for.
    Ack {
        seq: u64,
        responder: MemberId,
        payload: GossipPayload,
    },
    /// Indirect probe gave up on `target`. Informational only.
    Nack { seq: u64, target: MemberId },
}

impl Message {
    /// Correlation token carried in the common header.
    pub fn seq(&self) -> u64 {
        match self {
            Message::Ping { seq, .. }
            | Message::PingReq { seq, .. }
            | Message::Ack { seq, .. }
            | Message::Nack { seq, .. } => *seq,
        }
    }

    pub(crate) fn type_code(&self) -> u8 {
        match self {
            Message::Ping { .. } => 0x01,
            Message::PingReq { .. } => 0x02,
            Message::Ack { .. } => 0x03,
            Message::Nack { .. } => 0x04,
        }
    }
}
