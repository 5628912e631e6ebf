//! Membership change notifications.

use tokio::sync::broadcast;
use tracing::debug;

use crate::member::{Member, MemberId};

/// Coarse classification carried by [`Event::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Codec,
    Transport,
}

/// Notifications published by the engine. Every subscriber observes the
/// same sequence, in the order the state transitions were committed.
#[derive(Clone, Debug)]
pub enum Event {
    /// A previously unknown member entered the table.
    Joined(Member),
    /// A member failed direct and indirect probing.
    Suspected(Member),
    /// A suspicion deadline expired, or gossip reported the member dead.
    Failed(Member),
    /// A suspect or dead member proved to be alive after all.
    Recovered(Member),
    /// The local member left the cluster.
    LocalLeft(MemberId),
    /// The local incarnation advanced while refuting a rumour about itself.
    IncarnationIncremented(u64),
    /// A background operation failed; the protocol carries on regardless.
    Error(ErrorKind),
}

/// Receiving half of the engine's bounded event stream.
///
/// Slow consumers never stall the engine: when the buffer fills, the oldest
/// events are discarded and `recv` resumes from the oldest retained one.
pub struct EventStream {
    inner: broadcast::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(inner: broadcast::Receiver<Event>) -> Self {
        Self { inner }
    }

    /// A stream that is already at end-of-stream, handed out after `stop`.
    pub(crate) fn closed() -> Self {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Self { inner: rx }
    }

    /// The next event, or `None` once the engine has stopped and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event stream lagged, oldest events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Status;

    #[tokio::test]
    async fn closed_stream_yields_nothing() {
        let mut stream = EventStream::closed();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagged_receiver_skips_to_oldest_retained() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);

        for incarnation in 0..5u64 {
            tx.send(Event::IncarnationIncremented(incarnation)).unwrap();
        }
        drop(tx);

        // Capacity 2: events 0..3 were dropped on the producer side.
        let first = stream.recv().await;
        assert!(matches!(first, Some(Event::IncarnationIncremented(3))));
        let second = stream.recv().await;
        assert!(matches!(second, Some(Event::IncarnationIncremented(4))));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn events_carry_member_snapshots() {
        let member = Member::new(
            MemberId::new("node-a", "10.0.0.1:7946"),
            Status::Suspect,
            3,
        );
        let event = Event::Suspected(member.clone());
        match event {
            Event::Suspected(m) => assert_eq!(m, member),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
