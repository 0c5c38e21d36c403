//! Text-frame transport abstraction.
//!
//! The node only needs something that delivers UTF-8 frames to a named peer.
//! Inbound frames are fed back through
//! [`ConnectionManager::on_receive`](crate::ConnectionManager::on_receive).
//! [`MemoryHub`] wires nodes together inside one process.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Address of a remote peer as understood by the transport.
pub type PeerId = String;

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport has no route to the peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The peer's end has gone away.
    #[error("connection to {0} closed")]
    Closed(PeerId),

    /// Any other delivery failure.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outbound side of a text transport.
pub trait Transport: Send + Sync {
    /// Delivers one text frame to `peer`.
    fn send<'a>(
        &'a self,
        peer: &'a str,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// The local address other peers use to reach this node.
    fn local_peer(&self) -> &str;
}

/// A frame received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Sender address.
    pub from: PeerId,
    /// Frame contents.
    pub text: String,
}

/// In-process switchboard connecting [`MemoryTransport`] endpoints.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<DashMap<PeerId, mpsc::UnboundedSender<InboundFrame>>>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new endpoint named `peer`.
    ///
    /// Returns the transport to hand to the node and the receiver that
    /// yields frames addressed to it. Attaching an existing name replaces
    /// the previous endpoint.
    pub fn endpoint(
        &self,
        peer: impl Into<PeerId>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<InboundFrame>) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(peer.clone(), tx);
        debug!(peer = %peer, "Memory endpoint attached");
        (
            MemoryTransport {
                local: peer,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Detaches `peer`; subsequent sends to it fail with [`TransportError::UnknownPeer`].
    pub fn detach(&self, peer: &str) -> bool {
        self.endpoints.remove(peer).is_some()
    }

    /// Whether an endpoint named `peer` is attached.
    pub fn is_attached(&self, peer: &str) -> bool {
        self.endpoints.contains_key(peer)
    }

    fn deliver(&self, from: &str, to: &str, text: String) -> Result<(), TransportError> {
        let sender = self
            .endpoints
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        trace!(from, to, len = text.len(), "Delivering frame");
        sender
            .send(InboundFrame {
                from: from.to_string(),
                text,
            })
            .map_err(|_| TransportError::Closed(to.to_string()))
    }
}

/// Endpoint of a [`MemoryHub`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PeerId,
    hub: MemoryHub,
}

impl Transport for MemoryTransport {
    fn send<'a>(
        &'a self,
        peer: &'a str,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move { self.hub.deliver(&self.local, peer, text) })
    }

    fn local_peer(&self) -> &str {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_reach_named_endpoint() {
        let hub = MemoryHub::new();
        let (alice, _alice_rx) = hub.endpoint("alice");
        let (_bob, mut bob_rx) = hub.endpoint("bob");

        alice.send("bob", "hello".to_string()).await.unwrap();
        alice.send("bob", "again".to_string()).await.unwrap();

        let first = bob_rx.recv().await.unwrap();
        assert_eq!(first.from, "alice");
        assert_eq!(first.text, "hello");
        assert_eq!(bob_rx.recv().await.unwrap().text, "again");
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let hub = MemoryHub::new();
        let (alice, _rx) = hub.endpoint("alice");
        let err = alice.send("nobody", "x".to_string()).await.unwrap_err();
        assert_eq!(err, TransportError::UnknownPeer("nobody".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_closed() {
        let hub = MemoryHub::new();
        let (alice, _alice_rx) = hub.endpoint("alice");
        let (_bob, bob_rx) = hub.endpoint("bob");
        drop(bob_rx);

        let err = alice.send("bob", "x".to_string()).await.unwrap_err();
        assert_eq!(err, TransportError::Closed("bob".to_string()));
    }

    #[tokio::test]
    async fn test_detach() {
        let hub = MemoryHub::new();
        let (alice, _alice_rx) = hub.endpoint("alice");
        let (_bob, _bob_rx) = hub.endpoint("bob");
        assert!(hub.is_attached("bob"));
        assert!(hub.detach("bob"));
        assert!(!hub.is_attached("bob"));
        assert!(alice.send("bob", "x".to_string()).await.is_err());
        assert_eq!(alice.local_peer(), "alice");
    }
}
