//! Outbound transport boundary.
//!
//! The connection that carries packets to the peer lives outside the daemon
//! core. Sessions only see the [`Transport`] trait; [`ChannelTransport`] is the
//! in-process implementation that feeds a writer task (or a test).

use shellmux_protocol::Packet;
use tokio::sync::mpsc;

/// Delivers packets to the remote peer.
///
/// Sending never blocks: pumps call this from their read loops.
pub trait Transport: Send + Sync {
    /// Queues a packet for delivery. Packets are dropped once the connection
    /// is gone.
    fn send(&self, packet: Packet);
}

/// A [`Transport`] backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Packet>,
}

impl ChannelTransport {
    /// Creates the transport and the receiving end its packets arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Whether the receiving end is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, packet: Packet) {
        if self.tx.send(packet).is_err() {
            tracing::trace!("Transport closed, dropping packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellmux_protocol::act;

    #[tokio::test]
    async fn test_channel_transport_delivers_in_order() {
        let (transport, mut rx) = ChannelTransport::new();

        transport.send(Packet::output("evt", b"one"));
        transport.send(Packet::session_closed("evt", None));

        assert_eq!(rx.recv().await.unwrap().act, act::OUTPUT_TERMINAL);
        assert_eq!(rx.recv().await.unwrap().act, act::QUIT_TERMINAL);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new();
        assert!(transport.is_connected());

        drop(rx);
        assert!(!transport.is_connected());

        // Must not panic.
        transport.send(Packet::output("evt", b"lost"));
    }
}
