/*
    Switch - spanning tree actor and packet forwarder

    Owns the `SwitchTable` and is the only place it is mutated. Links register
    here and get a port; from then on they hand over every routed packet and
    every verified announcement, and receive our announcements and the
    packets we forward to them.

    Workflow:
      1. Link finishes its handshake -> `add_peer` -> port, our announcement
         is queued to it immediately
      2. Link receives an announcement -> `handle_msg` -> table decides;
         any change is re-announced to all links and published on the
         locator watch channel
      3. Link (or the local router, from port 0) submits a packet -> greedy
         next hop -> link queue, or the local router when nobody is closer
      4. Maintenance tick -> root timeout/refresh, forget silent peers

    Inputs:
      `SwitchCommand` over an mpsc channel, wrapped by `SwitchHandle`.

    Outputs:
      - `LinkCommand`s and raw packets to each link (try_send, never waits)
      - locally addressed packets to the router (try_send)
      - our `Locator` on a watch channel

    The switch never awaits another actor, so links and the router can block
    on it freely.
*/

pub mod locator;
pub mod table;

pub use locator::{dist, first_is_better, Locator};
pub use table::{PeerEntry, SwitchTable, SwitchTimers, SwitchUpdate};

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SwitchConfig;
use crate::core_link::{LinkCommand, LinkSender};
use crate::crypto::{BoxPublicKey, SigPublicKey};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use crate::wire::{packet_coords, SwitchMsg, SwitchPort};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwitchError {
    #[error("already linked to this peer on port {0}")]
    DuplicatePeer(SwitchPort),

    #[error("switch stopped")]
    Stopped,
}

/// Commands sent to the switch
#[derive(Debug)]
pub enum SwitchCommand {
    AddPeer {
        sig_key: SigPublicKey,
        box_key: BoxPublicKey,
        link: LinkSender,
        reply: oneshot::Sender<Result<SwitchPort, SwitchError>>,
    },
    RemovePeer(SwitchPort),
    /// A verified announcement; the reply says whether it names our root
    HandleMsg {
        port: SwitchPort,
        msg: SwitchMsg,
        reply: oneshot::Sender<bool>,
    },
    /// A routed packet arriving on `from` (0 = generated locally)
    Packet { from: SwitchPort, packet: Vec<u8> },
    Bandwidth { port: SwitchPort, bytes_per_sec: f64 },
    Snapshot(oneshot::Sender<SwitchSnapshot>),
}

/// Point-in-time view of one switch peer
#[derive(Debug, Clone)]
pub struct SwitchPeerInfo {
    pub port: SwitchPort,
    pub remote: String,
    pub sig_key: SigPublicKey,
    pub box_key: BoxPublicKey,
    /// The peer's own coordinates, once it has announced
    pub coords: Option<Vec<SwitchPort>>,
    pub root: Option<SigPublicKey>,
    pub bandwidth: f64,
    pub uptime: Duration,
    pub since_last_msg: Duration,
    pub is_parent: bool,
}

/// Point-in-time view of the switch
#[derive(Debug, Clone)]
pub struct SwitchSnapshot {
    pub locator: Locator,
    pub parent: SwitchPort,
    pub seq: u64,
    pub peers: Vec<SwitchPeerInfo>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Handle to the switch actor
#[derive(Clone)]
pub struct SwitchHandle {
    tx: mpsc::Sender<SwitchCommand>,
    locator: watch::Receiver<Locator>,
}

impl SwitchHandle {
    /// Spawn the switch. Locally addressed packets go to `router_tx`.
    pub fn new(
        key: SigPublicKey,
        config: &SwitchConfig,
        router_tx: mpsc::Sender<Vec<u8>>,
        shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let timers = SwitchTimers {
            timeout: config.timeout,
            update_interval: config.update_interval,
            throttle: config.throttle,
        };
        let table = SwitchTable::new(key, timers, Instant::now(), unix_now());
        let (locator_tx, locator_rx) = watch::channel(table.locator().clone());

        let switch = Switch {
            table,
            links: HashMap::new(),
            rx,
            router_tx,
            locator_tx,
            peer_timeout: config.peer_timeout,
            maintenance_interval: config.maintenance_interval,
        };
        let handle = tokio::spawn(switch.run(shutdown));

        (
            Self {
                tx,
                locator: locator_rx,
            },
            handle,
        )
    }

    pub async fn add_peer(
        &self,
        sig_key: SigPublicKey,
        box_key: BoxPublicKey,
        link: LinkSender,
    ) -> Result<SwitchPort, SwitchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SwitchCommand::AddPeer {
                sig_key,
                box_key,
                link,
                reply,
            })
            .await
            .map_err(|_| SwitchError::Stopped)?;
        rx.await.map_err(|_| SwitchError::Stopped)?
    }

    pub async fn remove_peer(&self, port: SwitchPort) -> Result<(), SwitchError> {
        self.tx
            .send(SwitchCommand::RemovePeer(port))
            .await
            .map_err(|_| SwitchError::Stopped)
    }

    /// Submit a verified announcement. Returns true if it names our root.
    pub async fn handle_msg(&self, port: SwitchPort, msg: SwitchMsg) -> Result<bool, SwitchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SwitchCommand::HandleMsg { port, msg, reply })
            .await
            .map_err(|_| SwitchError::Stopped)?;
        rx.await.map_err(|_| SwitchError::Stopped)
    }

    pub async fn send_packet(&self, from: SwitchPort, packet: Vec<u8>) -> Result<(), SwitchError> {
        self.tx
            .send(SwitchCommand::Packet { from, packet })
            .await
            .map_err(|_| SwitchError::Stopped)
    }

    /// Best effort; a full queue just skips this sample.
    pub fn report_bandwidth(&self, port: SwitchPort, bytes_per_sec: f64) {
        let _ = self.tx.try_send(SwitchCommand::Bandwidth {
            port,
            bytes_per_sec,
        });
    }

    pub async fn snapshot(&self) -> Result<SwitchSnapshot, SwitchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SwitchCommand::Snapshot(reply))
            .await
            .map_err(|_| SwitchError::Stopped)?;
        rx.await.map_err(|_| SwitchError::Stopped)
    }

    /// Our current locator.
    pub fn locator(&self) -> Locator {
        self.locator.borrow().clone()
    }

    pub fn coords(&self) -> Vec<SwitchPort> {
        self.locator.borrow().coords.clone()
    }

    /// Receiver notified whenever our tree position changes.
    pub fn subscribe_locator(&self) -> watch::Receiver<Locator> {
        self.locator.clone()
    }
}

struct Switch {
    table: SwitchTable,
    links: HashMap<SwitchPort, LinkSender>,
    rx: mpsc::Receiver<SwitchCommand>,
    router_tx: mpsc::Sender<Vec<u8>>,
    locator_tx: watch::Sender<Locator>,
    peer_timeout: Duration,
    maintenance_interval: Duration,
}

impl Switch {
    async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut tick = tokio::time::interval(self.maintenance_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(root = ?self.table.key(), "Switch started");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = tick.tick() => self.maintain(Instant::now()),
                _ = shutdown.recv() => break,
            }
        }

        for link in self.links.values() {
            let _ = link.control.try_send(LinkCommand::Close);
        }
        debug!("Switch stopped");
    }

    fn handle_command(&mut self, cmd: SwitchCommand) {
        let now = Instant::now();
        match cmd {
            SwitchCommand::AddPeer {
                sig_key,
                box_key,
                link,
                reply,
            } => {
                if let Some(port) = self.table.find_peer(&sig_key, &box_key) {
                    let _ = reply.send(Err(SwitchError::DuplicatePeer(port)));
                    return;
                }
                let port = self.table.add_peer(sig_key, box_key, now);
                self.links.insert(port, link);
                metrics::set_switch_peers(self.table.peer_count());
                debug!(port, peer = ?sig_key, "Switch peer added");
                let _ = reply.send(Ok(port));
                self.send_announcement(port);
            }
            SwitchCommand::RemovePeer(port) => {
                self.forget(port, now);
            }
            SwitchCommand::HandleMsg { port, msg, reply } => {
                let update = self.table.handle_msg(port, &msg, now);
                self.apply(update);
                let _ = reply.send(msg.root == self.table.locator().root);
            }
            SwitchCommand::Packet { from, packet } => self.forward(from, packet),
            SwitchCommand::Bandwidth {
                port,
                bytes_per_sec,
            } => self.table.set_bandwidth(port, bytes_per_sec),
            SwitchCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(now));
            }
        }
    }

    fn forward(&mut self, from: SwitchPort, packet: Vec<u8>) {
        let coords = match packet_coords(&packet) {
            Ok(coords) => coords,
            Err(e) => {
                debug!(port = from, error = %e, "Dropping unroutable packet");
                metrics::switch_packet("dropped");
                return;
            }
        };
        match self.table.next_hop(&coords) {
            None => {
                if self.router_tx.try_send(packet).is_err() {
                    metrics::switch_packet("dropped");
                } else {
                    metrics::switch_packet("local");
                }
            }
            Some(port) if port == from => {
                trace!(port, "Next hop is the sender, dropping");
                metrics::switch_packet("dropped");
            }
            Some(port) => match self.links.get(&port) {
                Some(link) if link.packets.try_send(packet).is_ok() => {
                    metrics::switch_packet("forwarded");
                }
                _ => metrics::switch_packet("dropped"),
            },
        }
    }

    fn maintain(&mut self, now: Instant) {
        let mut update = self.table.clean_root(now, unix_now());
        for port in self.table.silent_peers(now, self.peer_timeout) {
            warn!(port, "Switch peer timed out");
            if let Some(link) = self.links.get(&port) {
                let _ = link.control.try_send(LinkCommand::Close);
            }
            update.merge(self.table.remove_peer(port, now));
            self.links.remove(&port);
        }
        metrics::set_switch_peers(self.table.peer_count());
        self.apply(update);
    }

    fn forget(&mut self, port: SwitchPort, now: Instant) {
        let Some(link) = self.links.remove(&port) else {
            return;
        };
        let _ = link.control.try_send(LinkCommand::Close);
        let update = self.table.remove_peer(port, now);
        metrics::set_switch_peers(self.table.peer_count());
        debug!(port, "Switch peer removed");
        self.apply(update);
    }

    fn apply(&mut self, update: SwitchUpdate) {
        if update.coords_changed {
            let new = self.table.locator().clone();
            let root_changed = self.locator_tx.borrow().root != new.root;
            if root_changed {
                metrics::switch_root_changed();
                info!(root = ?new.root, coords = ?new.coords, "Switch root changed");
            } else {
                debug!(coords = ?new.coords, "Switch coordinates changed");
            }
            self.locator_tx.send_replace(new);
        } else {
            let tstamp = self.table.locator().tstamp;
            self.locator_tx.send_if_modified(|loc| {
                loc.tstamp = tstamp;
                false
            });
        }
        if update.announce {
            let ports: Vec<SwitchPort> = self.links.keys().copied().collect();
            for port in ports {
                self.send_announcement(port);
            }
        }
    }

    fn send_announcement(&self, port: SwitchPort) {
        let (Some(msg), Some(link)) = (self.table.get_msg(), self.links.get(&port)) else {
            return;
        };
        if link.control.try_send(LinkCommand::SendSwitchMsg(msg)).is_err() {
            debug!(port, "Link control queue full, announcement skipped");
        }
    }

    fn snapshot(&self, now: Instant) -> SwitchSnapshot {
        let parent = self.table.parent();
        let mut peers: Vec<SwitchPeerInfo> = self
            .table
            .peers()
            .map(|p| SwitchPeerInfo {
                port: p.port,
                remote: self
                    .links
                    .get(&p.port)
                    .map(|l| l.remote.clone())
                    .unwrap_or_default(),
                sig_key: p.sig_key,
                box_key: p.box_key,
                coords: p.coords().map(|c| c.to_vec()),
                root: p.locator.as_ref().map(|l| l.root),
                bandwidth: p.bandwidth,
                uptime: now.saturating_duration_since(p.first_seen),
                since_last_msg: now.saturating_duration_since(p.last_seen),
                is_parent: p.port == parent,
            })
            .collect();
        peers.sort_by_key(|p| p.port);
        SwitchSnapshot {
            locator: self.table.locator().clone(),
            parent,
            seq: self.table.seq(),
            peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BoxKeyPair, Handle, SigKeyPair};
    use crate::test_utils::{recv_timeout, DEFAULT_TEST_TIMEOUT, SHORT_TEST_TIMEOUT};
    use crate::wire::TrafficPacket;

    struct FakeLink {
        sender: LinkSender,
        control: mpsc::Receiver<LinkCommand>,
        packets: mpsc::Receiver<Vec<u8>>,
    }

    fn fake_link() -> FakeLink {
        let (control_tx, control) = mpsc::channel(16);
        let (packets_tx, packets) = mpsc::channel(16);
        FakeLink {
            sender: LinkSender {
                remote: "test".to_string(),
                control: control_tx,
                packets: packets_tx,
            },
            control,
            packets,
        }
    }

    fn spawn_switch() -> (SwitchHandle, SigPublicKey, mpsc::Receiver<Vec<u8>>, broadcast::Sender<ShutdownSignal>) {
        let key = SigKeyPair::generate().public;
        let (router_tx, router_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (handle, _task) = SwitchHandle::new(key, &SwitchConfig::default(), router_tx, shutdown_rx);
        (handle, key, router_rx, shutdown_tx)
    }

    fn traffic(coords: Vec<u64>) -> Vec<u8> {
        TrafficPacket {
            coords,
            handle: Handle::random(),
            nonce: crate::crypto::BoxNonce::random(),
            payload: vec![1, 2, 3],
        }
        .encode()
    }

    #[tokio::test]
    async fn test_add_peer_announces() {
        let (switch, key, _router, _stop) = spawn_switch();
        let mut link = fake_link();
        let port = switch
            .add_peer(SigKeyPair::generate().public, BoxKeyPair::generate().public, link.sender.clone())
            .await
            .unwrap();
        assert_eq!(port, 1);

        match recv_timeout(&mut link.control, DEFAULT_TEST_TIMEOUT).await.unwrap() {
            LinkCommand::SendSwitchMsg(msg) => {
                assert_eq!(msg.root, key);
                assert!(msg.hops.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let (switch, _key, _router, _stop) = spawn_switch();
        let sig = SigKeyPair::generate().public;
        let boxk = BoxKeyPair::generate().public;
        let first = switch.add_peer(sig, boxk, fake_link().sender).await.unwrap();
        let second = switch.add_peer(sig, boxk, fake_link().sender).await;
        assert_eq!(second, Err(SwitchError::DuplicatePeer(first)));

        // a different box key is a different peer
        let third = switch.add_peer(sig, BoxKeyPair::generate().public, fake_link().sender).await;
        assert_eq!(third, Ok(2));
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let (switch, _key, mut router, _stop) = spawn_switch();
        let packet = traffic(vec![]);
        switch.send_packet(0, packet.clone()).await.unwrap();
        assert_eq!(recv_timeout(&mut router, DEFAULT_TEST_TIMEOUT).await.unwrap(), packet);
    }

    #[tokio::test]
    async fn test_forwards_to_child() {
        let (switch, key, mut router, _stop) = spawn_switch();
        let mut link = fake_link();
        let child = SigKeyPair::generate();
        let port = switch
            .add_peer(child.public, BoxKeyPair::generate().public, link.sender.clone())
            .await
            .unwrap();

        // the child adopted us as root and announces itself at [port]
        let msg = SwitchMsg {
            root: key,
            tstamp: switch.locator().tstamp,
            hops: vec![
                crate::wire::SwitchMsgHop {
                    port,
                    next: child.public,
                    sig: crate::crypto::Signature::from_bytes([0; 64]),
                },
                crate::wire::SwitchMsgHop {
                    port: 1,
                    next: key,
                    sig: crate::crypto::Signature::from_bytes([0; 64]),
                },
            ],
        };
        assert!(switch.handle_msg(port, msg).await.unwrap());

        let packet = traffic(vec![port, 5]);
        switch.send_packet(0, packet.clone()).await.unwrap();
        assert_eq!(recv_timeout(&mut link.packets, DEFAULT_TEST_TIMEOUT).await.unwrap(), packet);
        assert!(recv_timeout(&mut router, SHORT_TEST_TIMEOUT).await.is_err());

        let snap = switch.snapshot().await.unwrap();
        assert_eq!(snap.peers.len(), 1);
        assert_eq!(snap.peers[0].coords, Some(vec![port]));
        assert!(!snap.peers[0].is_parent);
    }

    #[tokio::test]
    async fn test_shutdown_closes_links() {
        let (switch, _key, _router, stop) = spawn_switch();
        let mut link = fake_link();
        switch
            .add_peer(SigKeyPair::generate().public, BoxKeyPair::generate().public, link.sender.clone())
            .await
            .unwrap();
        let _ = recv_timeout(&mut link.control, DEFAULT_TEST_TIMEOUT).await;

        stop.send(ShutdownSignal::Graceful).unwrap();
        let cmd = recv_timeout(&mut link.control, DEFAULT_TEST_TIMEOUT).await.unwrap();
        assert!(matches!(cmd, LinkCommand::Close));
    }
}
