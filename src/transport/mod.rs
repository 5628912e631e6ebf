//! Transport abstraction the engine runs on.
//!
//! The engine never touches sockets directly: it hands encoded-ready
//! messages to a [`Transport`] and consumes a single ordered stream of
//! inbound `(message, sender)` pairs. Address parsing and delivery belong
//! to the transport; message semantics do not.

pub mod udp;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::member::MemberId;
use crate::message::Message;

pub use udp::UdpTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message to the member's routing address. Failures are
    /// reported but the engine treats them as probe timeouts.
    async fn send(&self, message: &Message, target: &MemberId) -> Result<(), TransportError>;

    /// Next inbound message with its attributed sender. Returns `None`
    /// once the transport has shut down; the stream is not restartable.
    async fn recv(&self) -> Option<(Message, MemberId)>;

    /// The address this transport is reachable at.
    fn local_address(&self) -> String;
}
