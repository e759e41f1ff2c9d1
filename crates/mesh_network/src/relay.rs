//! Relay policy: which neighbours receive a message that is not for us.
//!
//! Loop suppression has two parts: every node remembers recently seen
//! message ids in a [`SeenCache`] and drops repeats, and every hop spends
//! one unit of the message's `ttl`.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::message::Message;

/// Decides where a relayed message goes next.
pub trait RelayPolicy: Send + Sync {
    /// Choose relay targets among `known_peers`. `sender` is the neighbour
    /// the message arrived from, or `None` for locally originated messages.
    fn targets(
        &self,
        message: &Message,
        sender: Option<&PeerId>,
        known_peers: &[PeerId],
    ) -> Vec<PeerId>;
}

/// Forward to every known peer except the one it came from and its origin.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flood;

impl RelayPolicy for Flood {
    fn targets(
        &self,
        message: &Message,
        sender: Option<&PeerId>,
        known_peers: &[PeerId],
    ) -> Vec<PeerId> {
        known_peers
            .iter()
            .filter(|peer| Some(*peer) != sender && *peer != message.from())
            .cloned()
            .collect()
    }
}

/// Forward only when the destination is a direct neighbour. Broadcasts go
/// one hop: to every neighbour when originated here, nowhere when relayed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleHop;

impl RelayPolicy for SingleHop {
    fn targets(
        &self,
        message: &Message,
        sender: Option<&PeerId>,
        known_peers: &[PeerId],
    ) -> Vec<PeerId> {
        let to = message.to();
        if to.is_broadcast() {
            return match sender {
                None => known_peers.to_vec(),
                Some(_) => Vec::new(),
            };
        }
        if Some(to) != sender && known_peers.contains(to) {
            vec![to.clone()]
        } else {
            Vec::new()
        }
    }
}

/// Built-in policies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    #[default]
    Flood,
    SingleHop,
}

impl RelayMode {
    pub fn policy(self) -> Box<dyn RelayPolicy> {
        match self {
            Self::Flood => Box::new(Flood),
            Self::SingleHop => Box::new(SingleHop),
        }
    }
}

/// Bounded memory of recently seen message ids. Oldest ids are forgotten
/// first once the capacity is reached.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Record an id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
