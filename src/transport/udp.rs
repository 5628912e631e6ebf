//! UDP datagram transport.
//!
//! A single socket serves both directions so that the source address of our
//! outgoing datagrams is the address peers know us by. A background task
//! decodes inbound datagrams and feeds them into a channel; malformed
//! datagrams are logged and dropped, since the protocol is loss-tolerant.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{self, MAX_DATAGRAM};
use crate::error::TransportError;
use crate::member::MemberId;
use crate::message::Message;
use crate::transport::Transport;

const INCOMING_CHANNEL_CAPACITY: usize = 1024;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<(Message, MemberId)>>,
    /// Maps source addresses to the member identities we have sent to, so
    /// inbound datagrams are attributed to known members where possible.
    peers: Arc<DashMap<SocketAddr, MemberId>>,
    reader: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind a transport to the given address (`127.0.0.1:0` picks a free
    /// port) and start receiving.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(TransportError::SendFailed)?;
        let local_addr = socket.local_addr().map_err(TransportError::SendFailed)?;
        let socket = Arc::new(socket);
        let peers: Arc<DashMap<SocketAddr, MemberId>> = Arc::new(DashMap::new());

        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let reader = tokio::spawn(Self::read_loop(socket.clone(), peers.clone(), tx));

        Ok(Self {
            socket,
            local_addr,
            incoming: Mutex::new(rx),
            peers,
            reader,
        })
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        peers: Arc<DashMap<SocketAddr, MemberId>>,
        tx: mpsc::Sender<(Message, MemberId)>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(%err, "udp receive failed");
                    continue;
                }
            };

            let message = match codec::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%source, %err, "dropping undecodable datagram");
                    continue;
                }
            };

            let sender = peers
                .get(&source)
                .map(|entry| entry.value().clone())
                .unwrap_or_else(|| {
                    // First contact from this address: attribute it to an
                    // address-shaped identity until gossip names it.
                    MemberId::new(source.to_string(), source.to_string())
                });

            if tx.send((message, sender)).await.is_err() {
                debug!("incoming channel closed, stopping udp reader");
                break;
            }
        }
    }

    /// The bound address, also the address peers see our datagrams from.
    pub fn local_address(&self) -> String {
        self.local_addr.to_string()
    }

    async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        lookup_host(address)
            .await
            .map_err(TransportError::SendFailed)?
            .next()
            .ok_or_else(|| {
                TransportError::SendFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("address resolved to nothing: {}", address),
                ))
            })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &Message, target: &MemberId) -> Result<(), TransportError> {
        let addr = Self::resolve(&target.address).await?;
        let data = codec::encode(message).map_err(|err| {
            TransportError::SendFailed(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;

        self.peers.insert(addr, target.clone());
        self.socket
            .send_to(&data, addr)
            .await
            .map_err(TransportError::SendFailed)?;
        Ok(())
    }

    async fn recv(&self) -> Option<(Message, MemberId)> {
        self.incoming.lock().await.recv().await
    }

    fn local_address(&self) -> String {
        UdpTransport::local_address(self)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn transport_binds_to_ephemeral_port() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = transport.local_address().parse().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let b_id = MemberId::new("b", b.local_address());
        let message = Message::Ping {
            seq: 7,
            payload: vec![],
        };
        a.send(&message, &b_id).await.unwrap();

        let (received, sender) = timeout(Duration::from_millis(500), b.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received, message);
        // b never sent to a, so the sender is attributed by address only.
        assert_eq!(sender.address, a.local_address());
    }

    #[tokio::test]
    async fn known_peers_are_attributed_by_identity() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let a_id = MemberId::new("node-a", a.local_address());
        let b_id = MemberId::new("node-b", b.local_address());

        // b learns a's identity by sending to it first.
        b.send(
            &Message::Ping {
                seq: 1,
                payload: vec![],
            },
            &a_id,
        )
        .await
        .unwrap();
        let _ = timeout(Duration::from_millis(500), a.recv()).await;

        a.send(
            &Message::Nack {
                seq: 1,
                target: b_id.clone(),
            },
            &b_id,
        )
        .await
        .unwrap();

        let (_, sender) = timeout(Duration::from_millis(500), b.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(sender, a_id);
    }

    #[tokio::test]
    async fn undecodable_datagrams_are_dropped() {
        let receiver = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        raw.send_to(&[0xde, 0xad, 0xbe, 0xef], receiver.local_address())
            .await
            .unwrap();

        // A valid message after garbage still arrives.
        let valid = codec::encode(&Message::Ping {
            seq: 2,
            payload: vec![],
        })
        .unwrap();
        raw.send_to(&valid, receiver.local_address()).await.unwrap();

        let (received, _) = timeout(Duration::from_millis(500), receiver.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.seq(), 2);
    }

    #[tokio::test]
    async fn unresolvable_address_fails_send() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let bogus = MemberId::new("ghost", "not-a-routable-address");

        let result = transport
            .send(
                &Message::Ping {
                    seq: 1,
                    payload: vec![],
                },
                &bogus,
            )
            .await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }
}
