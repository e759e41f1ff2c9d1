//! Mesh Network: peer-to-peer messaging over framed TCP.
//!
//! This crate provides the networking core of a mesh messenger node: it
//! listens for peers, dials peers reported by a discovery feed, exchanges
//! length-prefixed message envelopes, delivers messages addressed to the
//! local node and relays the rest to its neighbours.
//!
//! # Architecture
//!
//! - **Message**: immutable envelope with a deterministic binary encoding.
//! - **Transport**: TCP listener and framed, split connections.
//! - **Peers**: registry of live peers; removal closes the connection.
//! - **Relay**: pluggable policy plus duplicate and hop-count suppression.
//! - **Discovery**: a queue external mechanisms push peer addresses into.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mesh_network::{MeshNode, MessageKind, NetworkConfig};
//!
//! # async fn example() {
//! let mut node = MeshNode::new(NetworkConfig::default());
//! let mut inbox = node.take_inbox().unwrap();
//!
//! node.start().await.unwrap();
//! node.broadcast(MessageKind::Status, "online").await.unwrap();
//! if let Some(message) = inbox.recv().await {
//!     println!("{}: {:?}", message.from(), message.payload_str());
//! }
//! node.stop().await;
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod relay;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use discovery::{DiscoveryHandle, StaticDiscovery};
pub use error::NetworkError;
pub use identity::PeerId;
pub use message::{Message, MessageKind, decode, encode};
pub use node::{MeshNode, NodeState, NodeStatus};
pub use peer::{PeerInfo, PeerRegistry};
pub use relay::{RelayMode, RelayPolicy};
pub use transport::{Connection, FrameLimits, Transport};
