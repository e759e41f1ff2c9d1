//! MeshNode: top-level coordinator for a mesh messenger node.
//!
//! [`MeshNode`] is the primary public API of mesh_network. It owns:
//! - the listening [`Transport`] and its accept loop
//! - one handler task per connection (handshake, receive, deliver, relay)
//! - the discovery consumer, which dials addresses pushed through a
//!   [`DiscoveryHandle`]
//! - the idle sweeper and the heartbeat loop
//!
//! Everything a task needs lives in one shared state behind an `Arc`. The
//! peer registry is the only mutable part and sits behind a
//! `tokio::sync::RwLock`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::discovery::{DISCOVERY_QUEUE, DiscoveryHandle, StaticDiscovery};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{Message, MessageKind};
use crate::peer::{PeerInfo, PeerRegistry};
use crate::relay::{RelayPolicy, SeenCache};
use crate::transport::{Connection, FrameLimits, Inbound, Transport};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lower bound for the sweep and heartbeat periods.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Lifecycle of a [`MeshNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Snapshot of a node's health, as reported by [`MeshNode::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub state: NodeState,
    /// Bound listen address, once the node has started.
    pub listen_addr: Option<SocketAddr>,
    pub peer_count: usize,
    /// Messages handed to the local inbox.
    pub delivered: u64,
    /// Relay copies written to neighbours.
    pub relayed: u64,
    /// Duplicates, echoes, malformed frames and inbox overflows.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// State shared by the node and all of its tasks.
struct Shared {
    id: PeerId,
    config: NetworkConfig,
    limits: FrameLimits,
    peers: RwLock<PeerRegistry>,
    relay: Box<dyn RelayPolicy>,
    seen: Mutex<SeenCache>,
    inbox: mpsc::Sender<Message>,
    shutdown: watch::Sender<bool>,
    local: OnceLock<SocketAddr>,
    advertised: OnceLock<SocketAddr>,
    handlers: Mutex<JoinSet<()>>,
    counters: Counters,
}

impl Shared {
    /// The introduction sent first on every connection and repeated as a
    /// heartbeat. It never travels more than one hop.
    fn hello(&self) -> Result<Message, NetworkError> {
        let listen = self
            .advertised
            .get()
            .map(ToString::to_string)
            .unwrap_or_default();
        Message::create(
            MessageKind::Discovery,
            self.id.clone(),
            PeerId::broadcast(),
            listen,
            self.config.max_payload_size,
        )
        .map(|message| message.with_ttl(0))
    }

    fn is_own_addr(&self, addr: SocketAddr) -> bool {
        let Some(local) = self.local.get() else {
            return false;
        };
        if addr == *local || self.advertised.get() == Some(&addr) {
            return true;
        }
        local.ip().is_unspecified() && addr.port() == local.port() && addr.ip().is_loopback()
    }
}

/// A mesh messenger node.
///
/// Create one per process, call [`start()`](MeshNode::start), read
/// delivered messages from [`take_inbox()`](MeshNode::take_inbox), and
/// call [`stop()`](MeshNode::stop) before exiting.
pub struct MeshNode {
    shared: Arc<Shared>,
    state: NodeState,
    transport: Option<Arc<Transport>>,
    discovery: DiscoveryHandle,
    discovery_rx: Option<mpsc::Receiver<SocketAddr>>,
    inbox_rx: Option<mpsc::Receiver<Message>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    /// Create a node with a freshly generated id.
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_id(PeerId::generate(), config)
    }

    /// Create a node with a known id and the relay policy named in `config`.
    pub fn with_id(id: PeerId, config: NetworkConfig) -> Self {
        let relay = config.relay_mode.policy();
        Self::with_policy(id, config, relay)
    }

    /// Create a node with a custom relay policy.
    pub fn with_policy(id: PeerId, config: NetworkConfig, relay: Box<dyn RelayPolicy>) -> Self {
        let (inbox, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (discovery, discovery_rx) = DiscoveryHandle::channel(DISCOVERY_QUEUE);
        let (shutdown, _) = watch::channel(false);
        let limits = config.frame_limits();
        let seen = SeenCache::new(config.seen_cache_capacity);

        let shared = Shared {
            id,
            config,
            limits,
            peers: RwLock::new(PeerRegistry::new()),
            relay,
            seen: Mutex::new(seen),
            inbox,
            shutdown,
            local: OnceLock::new(),
            advertised: OnceLock::new(),
            handlers: Mutex::new(JoinSet::new()),
            counters: Counters::default(),
        };

        Self {
            shared: Arc::new(shared),
            state: NodeState::Created,
            transport: None,
            discovery,
            discovery_rx: Some(discovery_rx),
            inbox_rx: Some(inbox_rx),
            tasks: Vec::new(),
        }
    }

    /// Return the node's peer ID.
    pub fn id(&self) -> &PeerId {
        &self.shared.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Return the node's configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    /// The bound listen address. `None` until the node has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local.get().copied()
    }

    /// Take the receiver of messages delivered to this node. Can be taken
    /// once.
    pub fn take_inbox(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.inbox_rx.take()
    }

    /// A handle external discovery mechanisms use to report peers.
    pub fn discovery(&self) -> DiscoveryHandle {
        self.discovery.clone()
    }

    /// Report a candidate peer address. Addresses queued before `start()`
    /// are dialed once the node runs.
    pub async fn on_peer_discovered(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        self.discovery.peer_discovered(addr).await
    }

    /// Snapshots of all registered peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peers.read().await.list()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.read().await.len()
    }

    pub async fn status(&self) -> NodeStatus {
        let counters = &self.shared.counters;
        NodeStatus {
            id: self.shared.id.clone(),
            state: self.state,
            listen_addr: self.local_addr(),
            peer_count: self.peer_count().await,
            delivered: counters.delivered.load(Ordering::Relaxed),
            relayed: counters.relayed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Start the node: bind the listener and spawn the accept, discovery,
    /// sweep and heartbeat loops. Configured bootstrap peers are queued for
    /// dialing.
    ///
    /// A bind failure is returned and leaves the node in
    /// [`NodeState::Created`].
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.state != NodeState::Created {
            return Err(NetworkError::AlreadyStarted);
        }

        let config = &self.shared.config;
        let transport = Arc::new(Transport::listen(config.listen_addr, self.shared.limits).await?);
        let local = transport.local_addr();
        let advertised = config.advertise_addr.unwrap_or(local);
        let _ = self.shared.local.set(local);
        let _ = self.shared.advertised.set(advertised);

        self.tasks.push(tokio::spawn(Self::accept_loop(
            Arc::clone(&self.shared),
            Arc::clone(&transport),
        )));
        if let Some(discovered) = self.discovery_rx.take() {
            self.tasks.push(tokio::spawn(Self::discovery_loop(
                Arc::clone(&self.shared),
                discovered,
            )));
        }
        self.tasks
            .push(tokio::spawn(Self::sweep_loop(Arc::clone(&self.shared))));
        self.tasks
            .push(tokio::spawn(Self::heartbeat_loop(Arc::clone(&self.shared))));

        if !config.known_peers.is_empty() {
            let bootstrap = StaticDiscovery::new(config.known_peers.clone());
            let handle = self.discovery.clone();
            self.tasks.push(tokio::spawn(async move {
                let queued = bootstrap.feed(&handle).await;
                debug!("Queued {queued} bootstrap peer(s)");
            }));
        }

        self.transport = Some(transport);
        self.state = NodeState::Started;
        info!(
            "Mesh node {} started on {local} (advertising {advertised})",
            self.shared.id
        );
        Ok(())
    }

    /// Stop the node: close the listener and every connection, then wait
    /// for background tasks, aborting any that outlive `shutdown_timeout`.
    ///
    /// Idempotent. A node that never started goes straight to
    /// [`NodeState::Stopped`].
    pub async fn stop(&mut self) {
        match self.state {
            NodeState::Stopping | NodeState::Stopped => return,
            NodeState::Created => {
                self.discovery_rx = None;
                self.state = NodeState::Stopped;
                debug!("Mesh node {} stopped before starting", self.shared.id);
                return;
            }
            NodeState::Started => {}
        }

        self.state = NodeState::Stopping;
        self.shared.shutdown.send_replace(true);
        if let Some(transport) = &self.transport {
            transport.close();
        }
        let disconnected = self.shared.peers.write().await.close_all();

        let mut tasks = std::mem::take(&mut self.tasks);
        let mut handlers = std::mem::take(&mut *self.shared.handlers.lock());
        let wait = async {
            for task in &mut tasks {
                let _ = task.await;
            }
            while handlers.join_next().await.is_some() {}
        };
        let timeout = self.shared.config.shutdown_timeout;
        let timed_out = tokio::time::timeout(timeout, wait).await.is_err();
        if timed_out {
            warn!("Background tasks still running after {timeout:?}, aborting them");
            for task in &tasks {
                task.abort();
            }
            handlers.abort_all();
        }

        // Handlers spawned while the loops were winding down.
        self.shared.handlers.lock().abort_all();
        self.shared.peers.write().await.close_all();

        self.transport = None;
        self.state = NodeState::Stopped;
        info!(
            "Mesh node {} stopped ({disconnected} peer(s) disconnected)",
            self.shared.id
        );
    }

    /// Dial a peer now instead of waiting for discovery.
    ///
    /// Returns once the connection is established; the peer is registered
    /// when its hello arrives.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        self.ensure_running()?;
        if self.shared.is_own_addr(addr) {
            debug!("Not dialing own address {addr}");
            return Ok(());
        }

        let connection =
            Transport::connect(addr, self.shared.limits, self.shared.config.connection_timeout)
                .await?;
        info!("Connected to {addr}");
        Self::spawn_handler(&self.shared, connection);
        Ok(())
    }

    /// Close the connection to `peer` and forget it. Returns whether the
    /// peer was connected. The peer may reconnect or be rediscovered later.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = self.shared.peers.write().await.remove(peer);
        if removed {
            info!("Disconnected from peer {peer}");
        }
        removed
    }

    /// Build a message from this node, stamped with the configured hop
    /// budget.
    pub fn message(
        &self,
        kind: MessageKind,
        to: PeerId,
        payload: impl Into<Bytes>,
    ) -> Result<Message, NetworkError> {
        let config = &self.shared.config;
        Message::create(
            kind,
            self.shared.id.clone(),
            to,
            payload,
            config.max_payload_size,
        )
        .map(|message| message.with_ttl(config.default_ttl))
    }

    /// Send a message. Returns the number of neighbours it was written to.
    ///
    /// A message for a direct peer goes only to that peer. Anything else is
    /// handed to the relay policy. A message addressed to this node is
    /// delivered to the local inbox.
    pub async fn send(&self, message: &Message) -> Result<usize, NetworkError> {
        self.ensure_running()?;
        self.shared.seen.lock().insert(message.id());

        let to = message.to();
        if *to == self.shared.id {
            Self::deliver(&self.shared, message.clone());
            return Ok(0);
        }

        let direct = {
            let peers = self.shared.peers.read().await;
            match peers.get(to) {
                Some(peer) => Some(
                    peer.send(message)
                        .await
                        .map_err(|e| (e, peer.connection_id())),
                ),
                None => None,
            }
        };

        match direct {
            Some(Ok(_)) => Ok(1),
            Some(Err((e, connection))) => {
                warn!("Send to {to} failed: {e}");
                self.shared
                    .peers
                    .write()
                    .await
                    .remove_connection(to, connection);
                Err(e)
            }
            None => {
                let sent = Self::fan_out(&self.shared, None, message).await;
                if sent == 0 && !to.is_broadcast() {
                    return Err(NetworkError::PeerNotFound(to.to_string()));
                }
                Ok(sent)
            }
        }
    }

    /// Send a payload to every node in the mesh.
    pub async fn broadcast(
        &self,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<usize, NetworkError> {
        let message = self.message(kind, PeerId::broadcast(), payload)?;
        self.send(&message).await
    }

    fn ensure_running(&self) -> Result<(), NetworkError> {
        if self.state == NodeState::Started {
            Ok(())
        } else {
            Err(NetworkError::NotRunning)
        }
    }

    // -----------------------------------------------------------------------
    // Internal tasks
    // -----------------------------------------------------------------------

    async fn accept_loop(shared: Arc<Shared>, transport: Arc<Transport>) {
        loop {
            match transport.accept().await {
                Ok(connection) => Self::spawn_handler(&shared, connection),
                Err(NetworkError::Closed) => break,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("Accept loop shutting down");
    }

    fn spawn_handler(shared: &Arc<Shared>, connection: Connection) {
        let mut handlers = shared.handlers.lock();
        while handlers.try_join_next().is_some() {}
        handlers.spawn(Self::handle_connection(Arc::clone(shared), connection));
    }

    /// Drive one connection from handshake to close.
    async fn handle_connection(shared: Arc<Shared>, connection: Connection) {
        let (mut inbound, outbound) = connection.split();
        let connection_id = inbound.id();
        let remote_addr = inbound.remote_addr();
        let mut shutdown = shared.shutdown.subscribe();

        let hello = match shared.hello() {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Cannot build hello for {remote_addr}: {e}");
                return;
            }
        };
        if let Err(e) = outbound.send_message(&hello).await {
            debug!("Hello to {remote_addr} failed: {e}");
            return;
        }

        let handshake = shared.config.handshake_timeout;
        let first = tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => return,
            first = tokio::time::timeout(handshake, first_message(&mut inbound)) => first,
        };
        let first = match first {
            Ok(Ok(message)) => message,
            Ok(Err(e)) if e.is_closed() => {
                debug!("{remote_addr} closed before introducing itself");
                return;
            }
            Ok(Err(e)) => {
                warn!("Handshake with {remote_addr} failed: {e}");
                return;
            }
            Err(_) => {
                debug!("{remote_addr} sent nothing within {handshake:?}, dropping");
                return;
            }
        };

        let peer_id = first.from().clone();
        if peer_id == shared.id {
            debug!("Dropping connection to self ({connection_id})");
            return;
        }
        if peer_id.is_broadcast() {
            warn!("{remote_addr} claims the broadcast id, dropping");
            return;
        }

        {
            let mut peers = shared.peers.write().await;
            let max_peers = shared.config.max_peers;
            if !peers.contains(&peer_id) && peers.len() >= max_peers {
                warn!("Peer limit ({max_peers}) reached, rejecting {peer_id} from {remote_addr}");
                return;
            }
            peers.register(peer_id.clone(), outbound);
        }
        info!("Peer {peer_id} connected from {remote_addr} ({connection_id})");

        Self::process(&shared, &peer_id, first).await;

        loop {
            let received = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                received = inbound.receive() => received,
            };
            match received {
                Ok(message) => Self::process(&shared, &peer_id, message).await,
                Err(e) if e.is_recoverable() => {
                    Counters::add(&shared.counters.dropped, 1);
                    warn!("Skipping frame from {peer_id}: {e}");
                }
                Err(e) if e.is_closed() => {
                    debug!("Connection to {peer_id} closed");
                    break;
                }
                Err(e) => {
                    warn!("Connection to {peer_id} failed: {e}");
                    break;
                }
            }
        }

        if shared
            .peers
            .write()
            .await
            .remove_connection(&peer_id, connection_id)
        {
            info!("Peer {peer_id} disconnected");
        }
    }

    /// Handle one message received from `sender`.
    async fn process(shared: &Shared, sender: &PeerId, message: Message) {
        shared.peers.read().await.touch(sender);

        if *message.from() == shared.id {
            Counters::add(&shared.counters.dropped, 1);
            debug!("Dropping echo of our own message {}", message.id());
            return;
        }
        // Hellos never travel past one hop and would only crowd the cache.
        if !is_hello(&message) && !shared.seen.lock().insert(message.id()) {
            Counters::add(&shared.counters.dropped, 1);
            debug!("Dropping duplicate message {} via {sender}", message.id());
            return;
        }

        let for_us = *message.to() == shared.id;
        if for_us || message.to().is_broadcast() {
            if message.kind() == MessageKind::Discovery {
                Self::record_listen_addr(shared, sender, &message).await;
            } else {
                Self::deliver(shared, message.clone());
            }
        }

        if !for_us {
            if let Some(next) = message.forwarded() {
                let relayed = Self::fan_out(shared, Some(sender), &next).await;
                Counters::add(&shared.counters.relayed, relayed as u64);
            }
        }
    }

    /// Remember where a direct neighbour accepts connections, as announced
    /// in its hello.
    async fn record_listen_addr(shared: &Shared, sender: &PeerId, message: &Message) {
        if message.from() != sender {
            return;
        }
        let Some(addr) = message
            .payload_str()
            .and_then(|text| text.parse::<SocketAddr>().ok())
        else {
            debug!("Hello from {sender} carries no usable listen address");
            return;
        };

        let mut peers = shared.peers.write().await;
        if let Some(peer) = peers.get_mut(sender) {
            // A wildcard bind is reachable at the address the peer dialed from.
            let addr = if addr.ip().is_unspecified() {
                SocketAddr::new(peer.remote_addr().ip(), addr.port())
            } else {
                addr
            };
            if peer.listen_addr() != Some(addr) {
                debug!("Peer {sender} listens on {addr}");
                peer.set_listen_addr(addr);
            }
        }
    }

    fn deliver(shared: &Shared, message: Message) {
        match shared.inbox.try_send(message) {
            Ok(()) => Counters::add(&shared.counters.delivered, 1),
            Err(mpsc::error::TrySendError::Full(message)) => {
                Counters::add(&shared.counters.dropped, 1);
                warn!("Inbox full, dropping message {}", message.id());
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                Counters::add(&shared.counters.dropped, 1);
                debug!("Inbox closed, dropping message {}", message.id());
            }
        }
    }

    /// Write `message` to the neighbours the relay policy picks.
    async fn fan_out(shared: &Shared, sender: Option<&PeerId>, message: &Message) -> usize {
        Self::send_to_each(shared, message, |known| {
            shared.relay.targets(message, sender, known)
        })
        .await
    }

    /// Write `message` to the peers `select` picks from the registered ids.
    /// Peers whose connection fails are removed.
    async fn send_to_each<F>(shared: &Shared, message: &Message, select: F) -> usize
    where
        F: FnOnce(&[PeerId]) -> Vec<PeerId>,
    {
        let (sent, failed) = {
            let peers = shared.peers.read().await;
            let targets = select(peers.ids().as_slice());
            let mut sent = 0;
            let mut failed = Vec::new();
            for target in targets {
                let Some(peer) = peers.get(&target) else {
                    continue;
                };
                match peer.send(message).await {
                    Ok(_) => sent += 1,
                    Err(e) => {
                        debug!("Send of {} to {target} failed: {e}", message.id());
                        failed.push((target, peer.connection_id()));
                    }
                }
            }
            (sent, failed)
        };

        if !failed.is_empty() {
            let mut peers = shared.peers.write().await;
            for (id, connection) in failed {
                if peers.remove_connection(&id, connection) {
                    info!("Removed unreachable peer {id}");
                }
            }
        }
        sent
    }

    /// Dial every discovered address that is neither ours nor connected.
    async fn discovery_loop(shared: Arc<Shared>, mut discovered: mpsc::Receiver<SocketAddr>) {
        let mut shutdown = shared.shutdown.subscribe();
        loop {
            let addr = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                addr = discovered.recv() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };

            if shared.is_own_addr(addr) {
                debug!("Ignoring own address {addr}");
                continue;
            }
            if shared.peers.read().await.is_connected_to(addr) {
                debug!("Already connected to {addr}");
                continue;
            }

            let timeout = shared.config.connection_timeout;
            let dialed = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                dialed = Transport::connect(addr, shared.limits, timeout) => dialed,
            };
            match dialed {
                Ok(connection) => {
                    info!("Dialed discovered peer {addr}");
                    Self::spawn_handler(&shared, connection);
                }
                Err(e) => warn!("Cannot reach discovered peer {addr}: {e}"),
            }
        }
        debug!("Discovery loop shutting down");
    }

    /// Periodically evict peers that have gone quiet.
    async fn sweep_loop(shared: Arc<Shared>) {
        let mut shutdown = shared.shutdown.subscribe();
        let idle_timeout = shared.config.idle_timeout;
        let mut ticker = tokio::time::interval(shared.config.sweep_interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = ticker.tick() => {
                    let evicted = shared.peers.write().await.sweep(idle_timeout);
                    if evicted > 0 {
                        info!("Evicted {evicted} idle peer(s)");
                    }
                }
            }
        }
        debug!("Sweep loop shutting down");
    }

    /// Heartbeat loop: repeats the hello to every peer at the configured
    /// interval.
    async fn heartbeat_loop(shared: Arc<Shared>) {
        let mut shutdown = shared.shutdown.subscribe();
        let interval = shared.config.heartbeat_interval.max(MIN_TICK);
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = tokio::time::sleep(interval) => {
                    let hello = match shared.hello() {
                        Ok(hello) => hello,
                        Err(e) => {
                            warn!("Cannot build heartbeat: {e}");
                            continue;
                        }
                    };
                    let sent = Self::send_to_each(&shared, &hello, |known| known.to_vec()).await;
                    debug!("Heartbeat sent to {sent} peer(s)");
                }
            }
        }
        debug!("Heartbeat loop shutting down");
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }
}

/// Wait for the node's shutdown signal.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Read until the first well-formed message. Malformed frames are skipped.
async fn first_message(inbound: &mut Inbound) -> Result<Message, NetworkError> {
    loop {
        match inbound.receive().await {
            Ok(message) => return Ok(message),
            Err(e) if e.is_recoverable() => {
                debug!("Skipping frame from {} during handshake: {e}", inbound.remote_addr());
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_hello(message: &Message) -> bool {
    message.kind() == MessageKind::Discovery && message.ttl() == 0 && message.to().is_broadcast()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.shutdown_timeout = Duration::from_secs(2);
        config
    }

    #[test]
    fn test_node_creation() {
        let node = MeshNode::new(NetworkConfig::default());
        assert_eq!(node.state(), NodeState::Created);
        assert_eq!(node.id().as_str().len(), 32);
        assert!(node.local_addr().is_none());
    }

    #[test]
    fn test_message_uses_configured_ttl() {
        let mut config = NetworkConfig::default();
        config.default_ttl = 3;
        let node = MeshNode::with_id(PeerId::from_string("node-a"), config);

        let message = node
            .message(MessageKind::Status, PeerId::from_string("node-b"), "online")
            .unwrap();
        assert_eq!(message.ttl(), 3);
        assert_eq!(message.from().as_str(), "node-a");
        assert_eq!(message.payload_str(), Some("online"));
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let mut node = MeshNode::new(local_config());

        node.start().await.unwrap();
        assert_eq!(node.state(), NodeState::Started);
        let addr = node.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let status = node.status().await;
        assert_eq!(status.state, NodeState::Started);
        assert_eq!(status.listen_addr, Some(addr));
        assert_eq!(status.peer_count, 0);

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);

        // Second stop is a no-op.
        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_node_double_start() {
        let mut node = MeshNode::new(local_config());
        node.start().await.unwrap();
        assert!(matches!(
            node.start().await,
            Err(NetworkError::AlreadyStarted)
        ));

        node.stop().await;
        assert!(matches!(
            node.start().await,
            Err(NetworkError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mut node = MeshNode::new(local_config());
        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(matches!(
            node.start().await,
            Err(NetworkError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_node_created() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config();
        config.listen_addr = taken.local_addr().unwrap();

        let mut node = MeshNode::new(config);
        assert!(matches!(
            node.start().await,
            Err(NetworkError::Bind { .. })
        ));
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_send_when_not_running() {
        let node = MeshNode::new(local_config());
        let message = node
            .message(MessageKind::Text, PeerId::from_string("elsewhere"), "hi")
            .unwrap();

        match node.send(&message).await {
            Err(NetworkError::NotRunning) => {}
            other => panic!("Expected NotRunning, got {other:?}"),
        }
        assert!(matches!(
            node.broadcast(MessageKind::Status, "up").await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_send_to_self_reaches_inbox() {
        let mut node = MeshNode::new(local_config());
        let mut inbox = node.take_inbox().unwrap();
        assert!(node.take_inbox().is_none());
        node.start().await.unwrap();

        let message = node
            .message(MessageKind::Text, node.id().clone(), "note to self")
            .unwrap();
        assert_eq!(node.send(&message).await.unwrap(), 0);
        assert_eq!(inbox.recv().await.unwrap(), message);
        assert_eq!(node.status().await.delivered, 1);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let mut node = MeshNode::new(local_config());
        node.start().await.unwrap();

        let message = node
            .message(MessageKind::Text, PeerId::from_string("nobody"), "hello?")
            .unwrap();
        assert!(matches!(
            node.send(&message).await,
            Err(NetworkError::PeerNotFound(_))
        ));
        // A broadcast with no neighbours simply reaches nobody.
        assert_eq!(node.broadcast(MessageKind::Status, "up").await.unwrap(), 0);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unblocks_silent_connection() {
        let mut node = MeshNode::new(local_config());
        node.start().await.unwrap();
        let addr = node.local_addr().unwrap();

        let mut client = Transport::connect(addr, FrameLimits::default(), Duration::from_secs(2))
            .await
            .unwrap();
        let hello = client.receive().await.unwrap();
        assert_eq!(hello.kind(), MessageKind::Discovery);
        assert_eq!(hello.from(), node.id());
        assert!(hello.to().is_broadcast());
        assert_eq!(hello.ttl(), 0);
        assert_eq!(hello.payload_str(), Some(addr.to_string().as_str()));

        // The client never introduces itself; stop must not wait on it.
        tokio::time::timeout(Duration::from_secs(3), node.stop())
            .await
            .unwrap();

        let err = client.receive().await.unwrap_err();
        assert!(err.is_closed(), "expected Closed, got {err:?}");
    }

    #[tokio::test]
    async fn test_dialing_own_address_is_skipped() {
        let mut node = MeshNode::new(local_config());
        node.start().await.unwrap();

        node.connect(node.local_addr().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.peer_count().await, 0);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_connection_claiming_our_id_is_dropped() {
        let mut node = MeshNode::new(local_config());
        node.start().await.unwrap();
        let addr = node.local_addr().unwrap();

        let mut client = Transport::connect(addr, FrameLimits::default(), Duration::from_secs(2))
            .await
            .unwrap();
        client.receive().await.unwrap();

        let impostor = Message::text(
            node.id().clone(),
            PeerId::broadcast(),
            "it's me",
            node.config().max_payload_size,
        )
        .unwrap();
        client.send_message(&impostor).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), client.receive())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_closed(), "expected Closed, got {err:?}");
        assert_eq!(node.peer_count().await, 0);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_hellos_do_not_evict_seen_messages() {
        let mut config = local_config();
        config.seen_cache_capacity = 4;
        let mut node = MeshNode::new(config);
        let mut inbox = node.take_inbox().unwrap();
        node.start().await.unwrap();
        let addr = node.local_addr().unwrap();

        let mut client = Transport::connect(addr, FrameLimits::default(), Duration::from_secs(2))
            .await
            .unwrap();
        client.receive().await.unwrap();

        let max = node.config().max_payload_size;
        let from = PeerId::from_string("client-b");
        let message = Message::text(from.clone(), node.id().clone(), "once", max).unwrap();
        client.send_message(&message).await.unwrap();
        for _ in 0..10 {
            let hello =
                Message::create(MessageKind::Discovery, from.clone(), PeerId::broadcast(), "", max)
                    .unwrap()
                    .with_ttl(0);
            client.send_message(&hello).await.unwrap();
        }
        client.send_message(&message).await.unwrap();
        let marker = Message::text(from, node.id().clone(), "marker", max).unwrap();
        client.send_message(&marker).await.unwrap();

        let wait = Duration::from_secs(2);
        let first = tokio::time::timeout(wait, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(first, message);
        let second = tokio::time::timeout(wait, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(second, marker);
        assert_eq!(node.status().await.dropped, 1);

        node.stop().await;
    }
}
