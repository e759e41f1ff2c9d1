//! Peer registry: live peers and the connections they own.
//!
//! Every registered [`Peer`] owns the write half of its connection. Any
//! operation that takes a peer out of the registry closes that connection.
//! A connection can also close underneath its entry when a write fails;
//! lookups and snapshots skip such entries and the next registration
//! drops them, so the registry never hands out a closed connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::Message;
use crate::transport::{ConnectionId, Outbound};

/// A remote node reachable over an established connection.
pub struct Peer {
    id: PeerId,
    connection: Outbound,
    listen_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl Peer {
    fn new(id: PeerId, connection: Outbound) -> Self {
        let now = Utc::now();
        Self {
            id,
            connection,
            listen_addr: None,
            connected_at: now,
            last_seen: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Address of the remote end of the connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    /// Address the peer advertised for inbound connections, if any.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn set_listen_addr(&mut self, addr: SocketAddr) {
        self.listen_addr = Some(addr);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    fn touch_at(&self, at: DateTime<Utc>) {
        *self.last_seen.lock() = at;
    }

    /// Whether the peer has been silent for longer than `max_idle` at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        now.signed_duration_since(self.last_seen())
            .to_std()
            .is_ok_and(|elapsed| elapsed > max_idle)
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Send a message and record the activity. A failed write closes the
    /// connection.
    pub(crate) async fn send(&self, message: &Message) -> Result<usize, NetworkError> {
        let written = self.connection.send_message(message).await?;
        self.touch();
        Ok(written)
    }

    /// Serializable snapshot of this peer.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            remote_addr: self.remote_addr(),
            listen_addr: self.listen_addr,
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
        }
    }

    fn close(&self) {
        self.connection.close();
    }
}

/// Information about a registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's unique identifier.
    pub id: PeerId,
    /// The remote end of the connection.
    pub remote_addr: SocketAddr,
    /// Address the peer listens on, when it told us.
    pub listen_addr: Option<SocketAddr>,
    /// When the connection was registered.
    pub connected_at: DateTime<Utc>,
    /// Last successful send or receive.
    pub last_seen: DateTime<Utc>,
}

/// Registry of live peers, keyed by peer id.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. A previous connection under the same id is closed
    /// and replaced.
    pub fn register(&mut self, id: PeerId, connection: Outbound) -> PeerInfo {
        self.prune_closed();
        let peer = Peer::new(id.clone(), connection);
        let info = peer.info();
        if let Some(previous) = self.peers.insert(id, peer) {
            debug!(
                "Peer {} re-registered, closing {}",
                previous.id,
                previous.connection_id()
            );
            previous.close();
        }
        info
    }

    /// Get a live peer by ID.
    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id).filter(|peer| !peer.is_closed())
    }

    /// Get a mutable reference to a live peer by ID.
    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id).filter(|peer| !peer.is_closed())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.get(id).is_some()
    }

    fn live(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|peer| !peer.is_closed())
    }

    /// Drop entries whose connection has already closed.
    fn prune_closed(&mut self) {
        self.peers.retain(|id, peer| {
            let open = !peer.is_closed();
            if !open {
                debug!("Dropping closed connection of peer {id}");
            }
            open
        });
    }

    /// Close a peer's connection and evict it. Returns whether it was present.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        match self.peers.remove(id) {
            Some(peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    /// Evict `id` only while it is still served by `connection`. A handler
    /// whose connection failed uses this so it cannot evict a newer
    /// connection registered under the same id.
    pub fn remove_connection(&mut self, id: &PeerId, connection: ConnectionId) -> bool {
        let current = self.peers.get(id).map(Peer::connection_id);
        if current == Some(connection) {
            self.remove(id)
        } else {
            false
        }
    }

    /// Update the last-seen timestamp for a peer.
    pub fn touch(&self, id: &PeerId) {
        if let Some(peer) = self.peers.get(id) {
            peer.touch();
        }
    }

    /// Evict and close every peer idle for longer than `max_idle`.
    pub fn sweep(&mut self, max_idle: Duration) -> usize {
        self.sweep_at(Utc::now(), max_idle)
    }

    /// [`sweep`](Self::sweep) against an explicit clock reading.
    pub fn sweep_at(&mut self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let idle: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_idle(now, max_idle))
            .map(|peer| peer.id.clone())
            .collect();

        for id in &idle {
            debug!("Evicting idle peer {id}");
            self.remove(id);
        }
        idle.len()
    }

    /// Close every connection and empty the registry.
    pub fn close_all(&mut self) -> usize {
        let count = self.peers.len();
        for (_, peer) in self.peers.drain() {
            peer.close();
        }
        count
    }

    /// Whether some peer is reached through, or listens on, `addr`.
    pub fn is_connected_to(&self, addr: SocketAddr) -> bool {
        self.live()
            .any(|peer| peer.remote_addr() == addr || peer.listen_addr == Some(addr))
    }

    /// IDs of all live peers.
    pub fn ids(&self) -> Vec<PeerId> {
        self.live().map(|peer| peer.id.clone()).collect()
    }

    /// Snapshots of all live peers.
    pub fn list(&self) -> Vec<PeerInfo> {
        self.live().map(Peer::info).collect()
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
