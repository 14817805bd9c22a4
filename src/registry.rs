use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::peer::{Peer, PeerId};
use crate::transport::{OnPeerFn, TransportError};

/// Live peers known to a file server, keyed by remote address.
///
/// Every access goes through one lock. Broadcasts work on a [`snapshot`]
/// so nothing is iterated while a connection task registers a new peer.
///
/// [`snapshot`]: PeerRegistry::snapshot
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashMap<PeerId, Arc<Peer>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<Peer>) {
        info!(
            "connected with remote {} ({})",
            peer.id(),
            if peer.is_outbound() { "outbound" } else { "inbound" }
        );
        self.peers.lock().insert(peer.id().to_string(), peer);
    }

    /// Registration hook for a transport's `on_peer`.
    pub fn on_peer(&self) -> OnPeerFn {
        let registry = self.clone();
        Arc::new(move |peer: Arc<Peer>| -> Result<(), TransportError> {
            registry.register(peer);
            Ok(())
        })
    }

    /// The peer behind `id`, if it is still open.
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(id).filter(|peer| !peer.is_closed()).cloned()
    }

    /// All open peers. Closed ones are dropped from the registry on the way.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.lock();
        peers.retain(|id, peer| {
            if peer.is_closed() {
                debug!("removing closed peer {}", id);
                return false;
            }
            true
        });
        peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> Arc<Peer> {
        let (ours, _theirs) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(ours);
        Arc::new(Peer::new(id, false, reader, writer))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty());

        registry.on_peer()(peer("10.0.0.1:3000")).unwrap();
        registry.register(peer("10.0.0.2:3000"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("10.0.0.1:3000").unwrap().id(), "10.0.0.1:3000");
        assert!(registry.get("10.0.0.3:3000").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_prunes_closed_peers() {
        let registry = PeerRegistry::new();
        let closing = peer("10.0.0.1:3000");
        registry.register(Arc::clone(&closing));
        registry.register(peer("10.0.0.2:3000"));

        closing.close().await.unwrap();
        assert!(registry.get("10.0.0.1:3000").is_none());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "10.0.0.2:3000");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = PeerRegistry::new();
        let other = registry.clone();
        other.register(peer("10.0.0.1:3000"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(other.is_empty());
    }
}
