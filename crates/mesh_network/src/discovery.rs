//! Discovery feed: how candidate peer addresses reach a node.
//!
//! Discovery mechanisms (mDNS, DHT, ...) live outside this crate. Whatever
//! finds peers pushes their addresses through a [`DiscoveryHandle`]; the
//! node dials every address it is not already connected to.
//! [`StaticDiscovery`] is the one built-in source: it resolves the
//! configured bootstrap peers.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Capacity of the discovery queue.
pub const DISCOVERY_QUEUE: usize = 64;

/// Sending side of a node's discovery queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::Sender<SocketAddr>,
}

impl DiscoveryHandle {
    /// Create a handle and the receiver the node consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SocketAddr>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Report a candidate peer address, waiting for queue space.
    pub async fn peer_discovered(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        self.tx
            .send(addr)
            .await
            .map_err(|_| NetworkError::NotRunning)
    }

    /// Report a candidate peer address without waiting. Returns `false` if
    /// the queue is full or the node is gone.
    pub fn try_peer_discovered(&self, addr: SocketAddr) -> bool {
        match self.tx.try_send(addr) {
            Ok(()) => true,
            Err(e) => {
                debug!("Discovery queue rejected {addr}: {e}");
                false
            }
        }
    }
}

/// A fixed list of `host:port` peers, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<String>) -> Self {
        Self { peers }
    }

    /// Resolve every entry. Entries that do not resolve are logged and
    /// skipped.
    pub async fn resolve(&self) -> Vec<SocketAddr> {
        let mut resolved = Vec::new();
        for entry in &self.peers {
            match tokio::net::lookup_host(entry.as_str()).await {
                Ok(mut addrs) => {
                    // One address per entry; the first is what a dial would use.
                    if let Some(addr) = addrs.next() {
                        resolved.push(addr);
                    } else {
                        warn!("Bootstrap peer {entry} resolved to no addresses");
                    }
                }
                Err(e) => warn!("Cannot resolve bootstrap peer {entry}: {e}"),
            }
        }
        resolved
    }

    /// Resolve and push every address into `handle`. Returns how many were
    /// queued.
    pub async fn feed(&self, handle: &DiscoveryHandle) -> usize {
        let mut queued = 0;
        for addr in self.resolve().await {
            if handle.peer_discovered(addr).await.is_err() {
                break;
            }
            queued += 1;
        }
        queued
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_delivers_addresses_in_order() {
        let (handle, mut rx) = DiscoveryHandle::channel(4);
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();

        handle.peer_discovered(a).await.unwrap();
        assert!(handle.clone().try_peer_discovered(b));

        assert_eq!(rx.recv().await, Some(a));
        assert_eq!(rx.recv().await, Some(b));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_node() {
        let (handle, rx) = DiscoveryHandle::channel(1);
        drop(rx);
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert!(matches!(
            handle.peer_discovered(addr).await,
            Err(NetworkError::NotRunning)
        ));
        assert!(!handle.try_peer_discovered(addr));
    }

    #[tokio::test]
    async fn test_try_send_on_full_queue() {
        let (handle, _rx) = DiscoveryHandle::channel(1);
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert!(handle.try_peer_discovered(addr));
        assert!(!handle.try_peer_discovered(addr));
    }

    #[tokio::test]
    async fn test_static_discovery_skips_unresolvable() {
        let feed = StaticDiscovery::new(vec![
            "127.0.0.1:9470".to_string(),
            "not an address".to_string(),
            "[::1]:9471".to_string(),
        ]);

        let resolved = feed.resolve().await;
        assert_eq!(
            resolved,
            vec![
                "127.0.0.1:9470".parse::<SocketAddr>().unwrap(),
                "[::1]:9471".parse::<SocketAddr>().unwrap(),
            ]
        );

        let (handle, mut rx) = DiscoveryHandle::channel(8);
        assert_eq!(feed.feed(&handle).await, 2);
        assert_eq!(rx.recv().await.unwrap().port(), 9470);
    }
}
