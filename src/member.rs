//! Member identity and liveness types shared across the protocol.

use std::fmt;

/// Stable identity of a cluster member.
///
/// Equality and hashing cover both the identifier and the routing address,
/// so the same process restarted under a new address counts as a distinct
/// member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId {
    /// Stable identifier chosen by the member itself.
    pub id: String,
    /// Routing string the transport delivers to, e.g. `host:port`.
    pub address: String,
}

impl MemberId {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Liveness state of a member, totally ordered by severity:
/// `Alive < Suspect < Dead`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Alive => write!(f, "alive"),
            Status::Suspect => write!(f, "suspect"),
            Status::Dead => write!(f, "dead"),
        }
    }
}

/// A member as known locally: identity plus the latest observed
/// (status, incarnation) pair. This triple is also the record format
/// piggybacked inside gossip payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub status: Status,
    pub incarnation: u64,
}

impl Member {
    pub fn new(id: MemberId, status: Status, incarnation: u64) -> Self {
        Self {
            id,
            status,
            incarnation,
        }
    }

    /// A freshly observed member: alive at incarnation zero.
    pub fn alive(id: MemberId) -> Self {
        Self::new(id, Status::Alive, 0)
    }
}
