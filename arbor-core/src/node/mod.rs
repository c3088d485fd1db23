//! Node
//!
//! Starts every component of one overlay node, wires them together and
//! exposes the operations an application or admin layer needs.
//!
//! # Architecture
//!
//! ```text
//!   links ──► Switch ──port 0──► Router ──► SessionManager ──► Session ──► Conn
//!     │         ▲                  │                              │
//!     │         │                  ▼                              │
//!     └──────► DHT ◄──────────── Search ◄─────────────────────────┘
//!               │                                   (dial / lost peer)
//!               └──► Outbound ──► Switch
//! ```
//!
//! Every component is an actor owning its state. They share one
//! `ShutdownCoordinator`, so `Node::shutdown` stops all of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::address::{Address, Subnet};
use crate::config::{Config, ConfigError};
use crate::core_dht::{DhtError, DhtHandle, DhtSnapshot};
use crate::core_link::{parse_uri, AllowedKeys, LinkContext, LinkError, LinkManager};
use crate::core_router::{Outbound, Router};
use crate::core_search::{SearchHandle, SearchSettings};
use crate::core_session::{Acceptor, Conn, SessionError, SessionManager, SessionSnapshot, WorkerPool};
use crate::core_switch::{SwitchError, SwitchHandle, SwitchSnapshot};
use crate::crypto::{
    BoxPublicKey, NodeId, NodeKeys, SharedKeyCache, SigCache, SigPublicKey,
    DEFAULT_SHARED_KEY_CACHE_SIZE, DEFAULT_SIG_CACHE_SIZE, DEFAULT_SIG_CACHE_TTL,
};
use crate::shutdown::ShutdownCoordinator;
use crate::wire::SwitchPort;

/// Packets the switch may queue for local delivery
const ROUTER_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("link: {0}")]
    Link(#[from] LinkError),

    #[error("switch: {0}")]
    Switch(#[from] SwitchError),

    #[error("dht: {0}")]
    Dht(#[from] DhtError),

    #[error("session: {0}")]
    Session(#[from] SessionError),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Identity and current position of this node.
#[derive(Debug, Clone)]
pub struct SelfInfo {
    pub box_key: BoxPublicKey,
    pub sig_key: SigPublicKey,
    pub node_id: NodeId,
    pub address: Address,
    pub subnet: Subnet,
    pub root: SigPublicKey,
    pub coords: Vec<SwitchPort>,
}

/// One directly linked peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub port: SwitchPort,
    pub remote: String,
    pub box_key: BoxPublicKey,
    pub address: Address,
    pub bytes_per_sec: f64,
    pub uptime: Duration,
    pub is_parent: bool,
}

pub struct Node {
    keys: Arc<NodeKeys>,
    config: Config,
    coordinator: ShutdownCoordinator,
    switch: SwitchHandle,
    dht: DhtHandle,
    search: SearchHandle,
    sessions: SessionManager,
    acceptor: Acceptor,
    links: LinkManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node with the keys in `config` (fresh ones where it has none).
    pub async fn start(config: Config) -> NodeResult<Self> {
        let keys = config.node_keys()?;
        Self::start_with_keys(config, keys).await
    }

    pub async fn start_with_keys(config: Config, keys: NodeKeys) -> NodeResult<Self> {
        config.validate()?;
        let allowed = AllowedKeys::new(config.allowed_keys()?);
        let keys = Arc::new(keys);
        let our_key = keys.box_keys.public;
        let coordinator = ShutdownCoordinator::new(config.node.shutdown_timeout);
        let mut tasks = Vec::new();

        let (router_tx, router_rx) = mpsc::channel(ROUTER_QUEUE);
        let (switch, task) = SwitchHandle::new(
            keys.sig_keys.public,
            &config.switch,
            router_tx,
            coordinator.subscribe(),
        );
        tasks.push(task);

        let shared = Arc::new(SharedKeyCache::new(
            keys.box_keys.secret.clone(),
            DEFAULT_SHARED_KEY_CACHE_SIZE,
        ));
        let outbound = Outbound::new(our_key, shared.clone(), switch.clone());

        let (search_tx, search_rx) = mpsc::unbounded_channel();
        let (dht, task) = DhtHandle::new(
            our_key,
            &config.dht,
            outbound.clone(),
            search_tx,
            coordinator.subscribe(),
        );
        tasks.push(task);

        let (search, task) = SearchHandle::new(
            our_key,
            SearchSettings::from(&config.session),
            dht.clone(),
            search_rx,
            coordinator.subscribe(),
        );
        tasks.push(task);

        let (pool, workers) = WorkerPool::new(config.worker_count(), &coordinator);
        tasks.extend(workers);

        let (sessions, acceptor, task) = SessionManager::new(
            our_key,
            &config.session,
            config.node.mtu,
            outbound,
            search.clone(),
            pool,
            coordinator.token(),
        );
        tasks.push(task);

        let router = Router::new(our_key, shared, dht.clone(), sessions.clone(), router_rx);
        tasks.push(router.spawn(coordinator.subscribe()));

        let links = LinkManager::new(LinkContext {
            keys: keys.clone(),
            switch: switch.clone(),
            dht: dht.clone(),
            sig_cache: Arc::new(SigCache::new(DEFAULT_SIG_CACHE_SIZE, DEFAULT_SIG_CACHE_TTL)),
            allowed,
            config: config.link.clone(),
            token: coordinator.token(),
        });

        let node = Self {
            keys,
            config,
            coordinator,
            switch,
            dht,
            search,
            sessions,
            acceptor,
            links,
            tasks: Mutex::new(tasks),
        };

        if let Err(e) = node.bring_up().await {
            node.shutdown().await;
            return Err(e);
        }

        info!(
            address = %node.address(),
            key = %our_key.to_hex(),
            "Node started"
        );
        Ok(node)
    }

    async fn bring_up(&self) -> NodeResult<()> {
        let listen = self.config.node.listen.clone();
        for uri in &listen {
            self.listen(uri).await?;
        }
        let peers = self.config.node.peers.clone();
        for uri in peers {
            self.add_peer(&uri).await?;
        }
        Ok(())
    }

    pub fn keys(&self) -> &NodeKeys {
        &self.keys
    }

    pub fn box_key(&self) -> BoxPublicKey {
        self.keys.box_keys.public
    }

    pub fn address(&self) -> Address {
        Address::for_key(&self.keys.box_keys.public)
    }

    pub fn subnet(&self) -> Subnet {
        Subnet::for_key(&self.keys.box_keys.public)
    }

    pub fn coords(&self) -> Vec<SwitchPort> {
        self.switch.coords()
    }

    pub fn self_info(&self) -> SelfInfo {
        let locator = self.switch.locator();
        SelfInfo {
            box_key: self.keys.box_keys.public,
            sig_key: self.keys.sig_keys.public,
            node_id: self.keys.node_id(),
            address: self.address(),
            subnet: self.subnet(),
            root: locator.root,
            coords: locator.coords,
        }
    }

    /// Accept links on `uri` (`tcp://host:port`). Returns the bound address.
    pub async fn listen(&self, uri: &str) -> NodeResult<SocketAddr> {
        Ok(self.links.listen(uri).await?)
    }

    /// Keep a link to `uri` up for the life of the node.
    pub async fn add_peer(&self, uri: &str) -> NodeResult<()> {
        parse_uri(uri)?;
        self.links
            .keep_peer(uri.to_string(), self.config.link.reconnect_interval)
            .await;
        Ok(())
    }

    /// Dial `uri` once and wait for the handshake.
    pub async fn connect(&self, uri: &str) -> NodeResult<SwitchPort> {
        Ok(self.links.dial(uri).await?)
    }

    /// Run a link over an already connected stream.
    pub async fn connect_stream<S>(
        &self,
        stream: S,
        remote: impl Into<String>,
        inbound: bool,
    ) -> NodeResult<SwitchPort>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Ok(self
            .links
            .connect_stream(stream, remote.into(), inbound)
            .await?)
    }

    /// Drop the link on `port`.
    pub async fn remove_peer(&self, port: SwitchPort) -> NodeResult<()> {
        Ok(self.switch.remove_peer(port).await?)
    }

    pub async fn peers(&self) -> NodeResult<Vec<PeerInfo>> {
        let snapshot = self.switch.snapshot().await?;
        Ok(snapshot
            .peers
            .into_iter()
            .map(|p| PeerInfo {
                port: p.port,
                remote: p.remote,
                address: Address::for_key(&p.box_key),
                box_key: p.box_key,
                bytes_per_sec: p.bandwidth,
                uptime: p.uptime,
                is_parent: p.is_parent,
            })
            .collect())
    }

    /// Spanning tree state: our locator, parent and every peer's position.
    pub async fn switch_peers(&self) -> NodeResult<SwitchSnapshot> {
        Ok(self.switch.snapshot().await?)
    }

    pub async fn dht(&self) -> NodeResult<DhtSnapshot> {
        Ok(self.dht.snapshot().await?)
    }

    pub async fn sessions(&self) -> NodeResult<Vec<SessionSnapshot>> {
        Ok(self.sessions.sessions().await?)
    }

    /// NodeIDs with a search in progress.
    pub async fn searches(&self) -> NodeResult<Vec<NodeId>> {
        Ok(self
            .search
            .outstanding()
            .await
            .map_err(SessionError::from)?)
    }

    /// Open a session to the node owning `key`.
    pub async fn dial_key(&self, key: BoxPublicKey) -> Result<Conn, SessionError> {
        self.sessions.dial_key(key).await
    }

    /// Open a session to the node owning `address`.
    pub async fn dial_address(&self, address: &Address) -> Result<Conn, SessionError> {
        self.sessions.dial_address(address).await
    }

    /// Open a session to the node owning `subnet`.
    pub async fn dial_subnet(&self, subnet: &Subnet) -> Result<Conn, SessionError> {
        self.sessions.dial_subnet(subnet).await
    }

    /// Open a session to a node matching `dest` on the bits set in `mask`.
    pub async fn dial(&self, dest: NodeId, mask: NodeId) -> Result<Conn, SessionError> {
        self.sessions.dial(dest, mask).await
    }

    /// Next session opened by a remote node.
    pub async fn accept(&self) -> Result<Conn, SessionError> {
        self.acceptor.accept().await
    }

    pub fn allowed_keys(&self) -> Vec<BoxPublicKey> {
        self.links.allowed_keys().list()
    }

    /// Only accept inbound links from listed keys. Returns false if already listed.
    pub fn add_allowed_key(&self, key: BoxPublicKey) -> bool {
        self.links.allowed_keys().add(key)
    }

    pub fn remove_allowed_key(&self, key: &BoxPublicKey) -> bool {
        self.links.allowed_keys().remove(key)
    }

    pub fn active_links(&self) -> usize {
        self.links.active_links()
    }

    pub async fn is_running(&self) -> bool {
        !self.coordinator.is_shutting_down().await
    }

    /// Stop every component and wait for them, up to the shutdown timeout.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        tasks.extend(self.links.take_tasks().await);
        if self.coordinator.is_shutting_down().await {
            warn!("Node already stopped");
            return;
        }
        self.coordinator.shutdown(tasks).await;
        info!(address = %self.address(), "Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, wait_until, TestConfigBuilder, DEFAULT_TEST_TIMEOUT};

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let node = Node::start(test_config()).await.unwrap();
        let info = node.self_info();
        assert_eq!(info.address, Address::for_key(&info.box_key));
        assert!(info.address.is_valid());
        assert!(info.subnet.is_valid());
        // alone, a node is its own root
        assert_eq!(info.root, info.sig_key);
        assert!(info.coords.is_empty());
        assert!(node.is_running().await);

        node.shutdown().await;
        assert!(!node.is_running().await);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = TestConfigBuilder::new().with_mtu(576).build();
        assert!(matches!(
            Node::start(config).await,
            Err(NodeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_peer_uri_fails_start() {
        let config = TestConfigBuilder::new().with_peer("udp://127.0.0.1:1").build();
        assert!(matches!(Node::start(config).await, Err(NodeError::Link(_))));
    }

    #[tokio::test]
    async fn test_listen_on_ephemeral_port() {
        let node = Node::start(test_config()).await.unwrap();
        let addr = node.listen("tcp://127.0.0.1:0").await.unwrap();
        assert_ne!(addr.port(), 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_allowed_key_management() {
        let node = Node::start(test_config()).await.unwrap();
        let other = crate::test_utils::test_box_key();
        assert!(node.allowed_keys().is_empty());
        assert!(node.add_allowed_key(other));
        assert!(!node.add_allowed_key(other));
        assert_eq!(node.allowed_keys(), vec![other]);
        assert!(node.remove_allowed_key(&other));
        assert!(node.allowed_keys().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_nodes_link_over_duplex() {
        let a = Node::start(test_config()).await.unwrap();
        let b = Node::start(test_config()).await.unwrap();
        let (sa, sb) = tokio::io::duplex(64 * 1024);
        let (pa, pb) = tokio::join!(
            a.connect_stream(sa, "duplex:b", false),
            b.connect_stream(sb, "duplex:a", true),
        );
        let port_a = pa.unwrap();
        pb.unwrap();

        let peers = a.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].box_key, b.box_key());
        assert_eq!(peers[0].address, b.address());

        // both end up in the same tree
        let (ra, rb) = (&a, &b);
        let converged = wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
            ra.self_info().root == rb.self_info().root
        })
        .await;
        assert!(converged);

        a.remove_peer(port_a).await.unwrap();
        let gone = wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
            rb.peers().await.map(|p| p.is_empty()).unwrap_or(false)
        })
        .await;
        assert!(gone);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_self_is_rejected() {
        let node = Node::start(test_config()).await.unwrap();
        assert_eq!(
            node.dial_key(node.box_key()).await.unwrap_err(),
            SessionError::SelfSession
        );
        node.shutdown().await;
    }
}
