//! Peer identity: unique node identification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of random bytes in a generated node id.
pub const PEER_ID_BYTES: usize = 16;

/// Reserved destination that addresses every node on the mesh.
const BROADCAST: &str = "*";

/// A unique identifier for a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID: 128 bits from the thread-local CSPRNG,
    /// hex-encoded.
    pub fn generate() -> Self {
        let raw: [u8; PEER_ID_BYTES] = rand::random();
        Self(hex::encode(raw))
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The destination that addresses every node.
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    /// Whether this is the broadcast destination.
    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
