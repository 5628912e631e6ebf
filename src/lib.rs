//! SWIM-style cluster membership and failure detection.
//!
//! `shoal` lets a process participate in a cluster of peers and maintain an
//! eventually consistent view of which of them are alive, suspected, or
//! dead. Liveness is established by periodic direct and indirect probes;
//! knowledge spreads epidemically by piggybacking membership updates on the
//! probe traffic. The host application observes the cluster through a
//! bounded stream of [`Event`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shoal::{Member, MemberId, SwimConfig, SwimEngine, UdpTransport};
//!
//! # async fn example() -> shoal::Result<()> {
//! let transport = Arc::new(UdpTransport::bind("0.0.0.0:7946").await?);
//! let local = Member::alive(MemberId::new("node-a", transport.local_address()));
//!
//! let engine = SwimEngine::new(local, SwimConfig::default(), transport);
//! engine.start();
//! engine
//!     .join(&[MemberId::new("node-b", "10.0.0.2:7946")])
//!     .await?;
//!
//! let mut events = engine.events();
//! while let Some(event) = events.recv().await {
//!     println!("membership change: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod engine;
pub mod error;
pub mod member;
pub mod membership;
pub mod message;
pub mod settings;
pub mod transport;

pub use engine::{ErrorKind, Event, EventStream, SwimEngine};
pub use error::{CodecError, Result, SwimError, TransportError};
pub use member::{Member, MemberId, Status};
pub use membership::{BroadcastQueue, Change, Disseminator, MembershipTable, MembershipUpdate};
pub use message::{GossipPayload, Message};
pub use settings::SwimConfig;
pub use transport::{Transport, UdpTransport};
