/*
    Sessions - encrypted datagram channels between two nodes

    The manager owns the session tables (by our handle, by remote key) and
    nothing else. Each session is its own actor (see `session.rs`); the
    manager only routes to them and hears when they close.

    Inputs:
      - Traffic packets from the router     -> session with that handle
      - Pings from the router               -> session for the sender's key,
                                               created on first ping and
                                               offered through accept()
      - dial_key / dial / dial_address      -> search, then open a session
                                               with the coordinates found

    Outputs:
      - `Conn`s, either returned by a dial or waiting in the accept queue
*/

mod conn;
mod error;
pub mod info;
mod session;
pub mod worker;

pub use conn::Conn;
pub use error::SessionError;
pub use info::{
    Liveness, PingOutcome, ReplayWindow, SessionInfo, SessionState, SessionTimers,
    MIN_SESSION_MTU,
};
pub use session::{SessionSnapshot, SessionStatus};
pub use worker::{Reorder, WorkerPool};

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use session::{Session, SessionClosed, SessionCommand, SessionContext};

use crate::address::{Address, Subnet};
use crate::config::SessionConfig;
use crate::core_router::Outbound;
use crate::core_search::SearchHandle;
use crate::crypto::{BoxPublicKey, Handle, NodeId};
use crate::metrics;
use crate::shutdown::CancelToken;
use crate::wire::{SessionPing, SwitchPort, TrafficPacket};

#[derive(Debug)]
enum ManagerCommand {
    Open {
        key: BoxPublicKey,
        coords: Vec<SwitchPort>,
        reply: oneshot::Sender<Result<Conn, SessionError>>,
    },
    Traffic(TrafficPacket),
    Ping {
        from: BoxPublicKey,
        ping: SessionPing,
    },
    Sessions(oneshot::Sender<Vec<mpsc::Sender<SessionCommand>>>),
}

/// Handle to the session manager. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<ManagerCommand>,
    our_key: BoxPublicKey,
    search: SearchHandle,
    handshake_timeout: Duration,
}

/// Inbound sessions waiting to be accepted.
pub struct Acceptor {
    rx: Mutex<mpsc::Receiver<Conn>>,
}

impl Acceptor {
    /// Next session opened by a remote node.
    pub async fn accept(&self) -> Result<Conn, SessionError> {
        self.rx.lock().await.recv().await.ok_or(SessionError::Closed)
    }
}

impl SessionManager {
    pub fn new(
        our_key: BoxPublicKey,
        config: &SessionConfig,
        our_mtu: u16,
        outbound: Outbound,
        search: SearchHandle,
        pool: WorkerPool,
        token: CancelToken,
    ) -> (Self, Acceptor, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            our_key,
            outbound,
            search: search.clone(),
            pool,
            timers: SessionTimers {
                timeout: config.timeout,
                ping_after: config.ping_after,
                search_after: config.search_after,
                ping_interval: config.ping_interval,
            },
            our_mtu,
            pending_queue: config.pending_queue,
            inbound_queue: config.inbound_queue,
            token,
        };
        let manager = Manager {
            ctx,
            rx,
            closed_tx,
            closed_rx,
            accept_tx,
            by_handle: HashMap::new(),
            by_key: HashMap::new(),
        };
        let handle = tokio::spawn(manager.run());
        (
            Self {
                tx,
                our_key,
                search,
                handshake_timeout: config.handshake_timeout,
            },
            Acceptor {
                rx: Mutex::new(accept_rx),
            },
            handle,
        )
    }

    pub async fn handle_traffic(&self, packet: TrafficPacket) {
        let _ = self.tx.send(ManagerCommand::Traffic(packet)).await;
    }

    pub async fn handle_ping(&self, from: BoxPublicKey, ping: SessionPing) {
        let _ = self.tx.send(ManagerCommand::Ping { from, ping }).await;
    }

    /// Open a session to the node with this permanent key.
    pub async fn dial_key(&self, key: BoxPublicKey) -> Result<Conn, SessionError> {
        if key == self.our_key {
            return Err(SessionError::SelfSession);
        }
        self.dial(NodeId::for_key(&key), NodeId::full_mask()).await
    }

    /// Open a session to whichever node matches `dest` on the bits in `mask`.
    pub async fn dial(&self, dest: NodeId, mask: NodeId) -> Result<Conn, SessionError> {
        let found = self.search.search(dest, mask).await?;
        if found.key == self.our_key {
            return Err(SessionError::SelfSession);
        }
        self.open(found.key, found.coords).await
    }

    pub async fn dial_address(&self, address: &Address) -> Result<Conn, SessionError> {
        let (dest, mask) = address.node_id_and_mask();
        self.dial(dest, mask).await
    }

    pub async fn dial_subnet(&self, subnet: &Subnet) -> Result<Conn, SessionError> {
        let (dest, mask) = subnet.node_id_and_mask();
        self.dial(dest, mask).await
    }

    /// Open a session to a node whose coordinates are already known.
    pub async fn open(
        &self,
        key: BoxPublicKey,
        coords: Vec<SwitchPort>,
    ) -> Result<Conn, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Open { key, coords, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        let conn = rx.await.map_err(|_| SessionError::Closed)??;
        let timer = crate::metrics::Timer::new("arbor_session_setup_seconds");
        // dropping the conn on failure closes the session
        conn.wait_established(self.handshake_timeout).await?;
        timer.stop();
        Ok(conn)
    }

    /// Snapshots of every live session.
    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Sessions(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        let senders = rx.await.map_err(|_| SessionError::Closed)?;

        let mut out = Vec::with_capacity(senders.len());
        for tx in senders {
            let (reply, rx) = oneshot::channel();
            if tx.send(SessionCommand::Snapshot(reply)).await.is_err() {
                continue;
            }
            if let Ok(snapshot) = rx.await {
                out.push(snapshot);
            }
        }
        out.sort_by_key(|s| s.remote);
        Ok(out)
    }
}

struct Manager {
    ctx: SessionContext,
    rx: mpsc::Receiver<ManagerCommand>,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
    closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
    accept_tx: mpsc::Sender<Conn>,
    by_handle: HashMap<Handle, mpsc::Sender<SessionCommand>>,
    by_key: HashMap<BoxPublicKey, Handle>,
}

impl Manager {
    async fn run(mut self) {
        let token = self.ctx.token.clone();
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(closed) = self.closed_rx.recv() => self.forget(closed),
                _ = token.cancelled() => break,
            }
        }
        debug!(sessions = self.by_handle.len(), "Session manager stopped");
    }

    fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Open { key, coords, reply } => {
                if self.by_key.contains_key(&key) {
                    let _ = reply.send(Err(SessionError::Exists(key)));
                    return;
                }
                let conn = self.create(key, Some(coords));
                let _ = reply.send(Ok(conn));
            }
            ManagerCommand::Traffic(packet) => match self.by_handle.get(&packet.handle) {
                Some(tx) => {
                    if tx.try_send(SessionCommand::Traffic(packet)).is_err() {
                        metrics::session_dropped("session_busy");
                    }
                }
                None => {
                    trace!(handle = ?packet.handle, "Traffic for unknown session");
                    metrics::session_dropped("unknown_handle");
                }
            },
            ManagerCommand::Ping { from, ping } => self.route_ping(from, ping),
            ManagerCommand::Sessions(reply) => {
                let _ = reply.send(self.by_handle.values().cloned().collect());
            }
        }
    }

    fn route_ping(&mut self, from: BoxPublicKey, ping: SessionPing) {
        if from == self.ctx.our_key {
            return;
        }
        if let Some(tx) = self.by_key.get(&from).and_then(|h| self.by_handle.get(h)) {
            let _ = tx.try_send(SessionCommand::Ping(ping));
            return;
        }
        if ping.is_pong {
            trace!(from = ?from, "Pong without a session");
            return;
        }

        let conn = self.create(from, None);
        let Some(tx) = self.by_handle.get(&conn.handle()) else {
            return;
        };
        let _ = tx.try_send(SessionCommand::Ping(ping));
        // a refused conn is dropped here, which closes its session
        if self.accept_tx.try_send(conn).is_err() {
            warn!(from = ?from, "Accept backlog full, refusing session");
        }
    }

    fn create(&mut self, key: BoxPublicKey, coords: Option<Vec<SwitchPort>>) -> Conn {
        let parts = Session::spawn(self.ctx.clone(), key, coords, self.closed_tx.clone());
        let handle = parts.handle;
        self.by_handle.insert(handle, parts.tx.clone());
        self.by_key.insert(key, handle);
        metrics::set_active_sessions(self.by_handle.len());
        Conn::new(key, parts)
    }

    fn forget(&mut self, closed: SessionClosed) {
        self.by_handle.remove(&closed.handle);
        if self.by_key.get(&closed.remote) == Some(&closed.handle) {
            self.by_key.remove(&closed.remote);
        }
        metrics::set_active_sessions(self.by_handle.len());
    }
}
