use tokio::sync::mpsc;

use crate::protocol::WireMessage;

/// A single duplex connection to one adjacent bus (either this bus's
/// parent, or one of its children). The bus engine never speaks raw
/// bytes to a peer stack: `PeerStack` frames and delivers `WireMessage`
/// values, leaving encoding, encryption, and physical transport to the
/// out-of-scope RPC/transport layer.
///
/// Production code implements this over whatever duplex channel the
/// surrounding application provides (a QUIC stream, a WebSocket, an
/// in-process channel). Tests use `InMemoryPeerStack`.
#[async_trait::async_trait]
pub trait PeerStack: Send + Sync {
    /// Send one message to the peer on the other end of this stack.
    async fn send(&self, message: WireMessage) -> Result<(), String>;

    /// Receive the next message from the peer, or `None` once the
    /// connection has closed.
    async fn recv(&mut self) -> Option<WireMessage>;
}

/// An in-process, channel-backed `PeerStack` pair, useful for wiring two
/// `Bus` instances together in tests without a real transport.
pub struct InMemoryPeerStack {
    tx: mpsc::Sender<WireMessage>,
    rx: mpsc::Receiver<WireMessage>,
}

impl InMemoryPeerStack {
    /// Build a connected pair: messages sent on one end arrive on the
    /// other's `recv`.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(buffer);
        let (tx_b, rx_a) = mpsc::channel(buffer);
        (
            InMemoryPeerStack { tx: tx_a, rx: rx_a },
            InMemoryPeerStack { tx: tx_b, rx: rx_b },
        )
    }
}

#[async_trait::async_trait]
impl PeerStack for InMemoryPeerStack {
    async fn send(&self, message: WireMessage) -> Result<(), String> {
        self.tx
            .send(message)
            .await
            .map_err(|_| "in-memory peer stack closed".to_string())
    }

    async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlMessage, WireMessage};
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn pair_delivers_messages_in_both_directions() {
        let (mut a, mut b) = InMemoryPeerStack::pair(8);
        let announce = ControlMessage::announce("n1".to_string(), BTreeSet::from(["".to_string()]));
        let correlation_id = announce.correlation_id();
        let msg = WireMessage::Control(announce);
        a.send(msg.clone()).await.unwrap();
        let received = b.recv().await.unwrap();
        assert_eq!(received, msg);

        let reply = WireMessage::Control(ControlMessage::Ack { correlation_id });
        b.send(reply.clone()).await.unwrap();
        let received_back = a.recv().await.unwrap();
        assert_eq!(received_back, reply);
    }

    #[tokio::test]
    async fn recv_returns_none_after_sender_dropped() {
        let (a, mut b) = InMemoryPeerStack::pair(8);
        drop(a);
        assert!(b.recv().await.is_none());
    }
}
