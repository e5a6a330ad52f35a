//! Transport seam and an in-process loopback relay

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::protocol::{decode_inbound, encode_outbound, InboundMsg, OutboundMsg, ProtocolError};

/// Push-stream transport used by a single peer.
///
/// Delivery is best effort: a failed `publish` is never retried by the
/// caller, the next periodic flush carries the current state again.
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to messages addressed to this peer
    fn subscribe(&self) -> broadcast::Receiver<InboundMsg>;

    /// Publish a message on behalf of this peer
    fn publish(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Capacity of the peer fan-out channel
pub const RELAY_CAPACITY: usize = 1024;

/// In-process relay: peer pause/resume traffic is fanned out to every peer
/// (the sender included), everything is forwarded to the authority inbox.
///
/// Relayed messages pass through the JSON codec so the loopback path decodes
/// exactly what a real transport would.
#[derive(Clone)]
pub struct LoopbackHub {
    peers_tx: broadcast::Sender<InboundMsg>,
    authority_tx: mpsc::UnboundedSender<OutboundMsg>,
    relayed: Arc<AtomicU64>,
}

impl LoopbackHub {
    /// Create a hub and the receiving end of the authority inbox
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMsg>) {
        let (peers_tx, _) = broadcast::channel(RELAY_CAPACITY);
        let (authority_tx, authority_rx) = mpsc::unbounded_channel();
        let hub = Self {
            peers_tx,
            authority_tx,
            relayed: Arc::new(AtomicU64::new(0)),
        };
        (hub, authority_rx)
    }

    /// Connect a new peer
    pub fn connect(&self) -> LoopbackTransport {
        LoopbackTransport { hub: self.clone() }
    }

    /// Push an authority message to every connected peer, returns receiver count
    pub fn broadcast(&self, msg: InboundMsg) -> usize {
        self.peers_tx.send(msg).unwrap_or(0)
    }

    /// Number of peer-to-peer messages relayed so far
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    fn relay(&self, msg: OutboundMsg) -> Result<(), TransportError> {
        if let Some(inbound) = msg.to_peer_inbound() {
            let wire = encode_outbound(&msg)?;
            let decoded = decode_inbound(&wire).unwrap_or(inbound);
            self.relayed.fetch_add(1, Ordering::Relaxed);
            if self.peers_tx.send(decoded).is_err() {
                debug!("No peers subscribed to relay");
            }
        }
        self.authority_tx
            .send(msg)
            .map_err(|_| TransportError::Closed)
    }
}

/// A peer's connection to a [`LoopbackHub`]
#[derive(Clone)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
}

impl Transport for LoopbackTransport {
    fn subscribe(&self) -> broadcast::Receiver<InboundMsg> {
        self.hub.peers_tx.subscribe()
    }

    fn publish(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<(), TransportError>> {
        let result = self.hub.relay(msg);
        async move { result }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::PeerId;

    #[tokio::test]
    async fn pause_is_relayed_to_all_peers_and_authority() {
        let (hub, mut authority_rx) = LoopbackHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.publish(OutboundMsg::Pause {
            peer_id: PeerId::from("a"),
            token: 3,
        })
        .await
        .expect("publish");

        for rx in [&mut a_rx, &mut b_rx] {
            match rx.recv().await.expect("relay") {
                InboundMsg::Pause { peer_id, token, .. } => {
                    assert_eq!(peer_id, PeerId::from("a"));
                    assert_eq!(token, Some(3));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(authority_rx.recv().await, Some(OutboundMsg::Pause { .. })));
        assert_eq!(hub.relayed(), 1);
    }

    #[tokio::test]
    async fn hits_go_only_to_authority() {
        let (hub, mut authority_rx) = LoopbackHub::new();
        let a = hub.connect();
        let mut a_rx = a.subscribe();

        a.publish(OutboundMsg::Hits {
            peer_id: PeerId::from("a"),
            hits: vec![],
        })
        .await
        .expect("publish");

        assert!(matches!(authority_rx.recv().await, Some(OutboundMsg::Hits { .. })));
        assert!(matches!(
            a_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn publish_fails_once_authority_inbox_is_gone() {
        let (hub, authority_rx) = LoopbackHub::new();
        drop(authority_rx);
        let a = hub.connect();
        let result = tokio_test::block_on(a.publish(OutboundMsg::Pos {
            peer_id: PeerId::from("a"),
            x: 0.0,
            y: 0.0,
            hp: 1.0,
            max_hp: 1.0,
        }));
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
