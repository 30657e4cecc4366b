//! Connected clients, keyed by the identity they assert

use std::collections::HashMap;
use std::sync::Arc;

use hubsync_transport::Outbox;
use tokio::sync::RwLock;

/// Distinguishes successive connections that claim the same identity
pub type ConnId = u64;

/// One live connection
#[derive(Debug, Clone)]
pub struct Peer {
    pub conn_id: ConnId,
    pub outbox: Outbox,
}

/// Shared map of identity → connection
///
/// The map itself is never handed out; callers go through the accessors.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the connection for `identity`
    ///
    /// Returns true if the identity was not already bound to this connection.
    pub async fn upsert(&self, identity: &str, peer: Peer) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(identity) {
            Some(existing) if existing.conn_id == peer.conn_id => false,
            _ => {
                peers.insert(identity.to_string(), peer);
                true
            }
        }
    }

    pub async fn lookup(&self, identity: &str) -> Option<Peer> {
        self.peers.read().await.get(identity).cloned()
    }

    /// Remove `identity`, but only while it still belongs to `conn_id`
    ///
    /// A client that reconnected under the same name keeps its new entry
    /// when the old connection's task winds down.
    pub async fn remove(&self, identity: &str, conn_id: ConnId) -> bool {
        let mut peers = self.peers.write().await;
        if peers.get(identity).is_some_and(|p| p.conn_id == conn_id) {
            peers.remove(identity);
            true
        } else {
            false
        }
    }

    /// Snapshot every peer other than `identity`
    ///
    /// The lock is released on return, so sending to the peers never holds it.
    pub async fn peers_except(&self, identity: &str) -> Vec<(String, Outbox)> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(name, _)| name.as_str() != identity)
            .map(|(name, peer)| (name.clone(), peer.outbox.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
