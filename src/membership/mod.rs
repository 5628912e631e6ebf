//! Local membership state: the authoritative table, the broadcast queue of
//! pending gossip, and the disseminator coordinating the two.

pub mod broadcast;
pub mod disseminator;
pub mod table;

pub use broadcast::{BroadcastQueue, MembershipUpdate};
pub use disseminator::Disseminator;
pub use table::{Change, MembershipTable};
