//! Connected peers and the process-wide registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Which side of a session a peer is on. Assigned once via `setPeerStatus`
/// and immutable for the rest of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Producer,
    Consumer,
}

/// An authenticated WebSocket connection.
///
/// Outbound frames go through an unbounded channel drained by the
/// connection's send task, so any handler can write to any live peer
/// without owning its socket.
pub struct Peer {
    pub id: String,
    /// Sticky-routing token from the handshake cookie; opaque here,
    /// forwarded to the session service.
    pub ws_conn_id: String,
    /// Present only for consumers.
    pub user_id: Option<i64>,
    state: Mutex<PeerState>,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct PeerState {
    role: Option<PeerRole>,
    meta: Option<Map<String, Value>>,
}

impl Peer {
    pub fn new(
        ws_conn_id: String,
        user_id: Option<i64>,
        tx: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            ws_conn_id,
            user_id,
            state: Mutex::default(),
            tx,
        })
    }

    /// Queue a text frame for delivery. A send failure only means the
    /// connection is already gone; the owning read loop notices on its own.
    pub fn send(&self, text: String) {
        tracing::debug!(peer_id = %self.id, role = ?self.role(), ">>> {text}");
        if self.tx.send(text).is_err() {
            tracing::debug!(peer_id = %self.id, "dropped frame for closed connection");
        }
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).role
    }

    pub fn set_role(&self, role: PeerRole) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).role = Some(role);
    }

    pub fn meta(&self) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .meta
            .clone()
    }

    pub fn set_meta(&self, meta: Map<String, Value>) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).meta = Some(meta);
    }
}

/// Process-wide connection directory: live peers plus the consumer→producer
/// announcement map. A single mutex guards both; every operation is short
/// and never held across I/O.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<String, Arc<Peer>>,
    consumers_to_producers: HashMap<String, String>,
}

impl Registry {
    pub fn insert(&self, peer: Arc<Peer>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.insert(peer.id.clone(), peer);
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.contains_key(peer_id)
    }

    pub fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.remove(peer_id)
    }

    /// Record that `producer_id` has a stream ready for `consumer_id`.
    /// Entries are never cleared when a producer dies; liveness is checked
    /// at read time instead.
    pub fn announce_producer(&self, consumer_id: &str, producer_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .consumers_to_producers
            .insert(consumer_id.to_string(), producer_id.to_string());
    }

    /// The live producer announced for this consumer, if any.
    pub fn producer_for_consumer(&self, consumer_id: &str) -> Option<Arc<Peer>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let producer_id = inner.consumers_to_producers.get(consumer_id)?;
        inner.peers.get(producer_id).cloned()
    }
}

#[cfg(test)]
pub(crate) fn test_peer(
    ws_conn_id: &str,
    user_id: Option<i64>,
) -> (Arc<Peer>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Peer::new(ws_conn_id.to_string(), user_id, tx), rx)
}
