/*
    Session actor - one per remote node

    Owns a `SessionInfo` and is the only place it changes. Crypto runs on
    the shared worker pool; completions come back on `done` and are
    released in submission order, so what the application wrote leaves in
    order and what arrives is handed up in order.

    Inputs:
      - Write     -> size check against the MTU, queue until established,
                     then seal and send
      - Traffic   -> replay pre-check, open, replay check, hand to the Conn
      - Ping      -> update keys/coords/MTU, pong if asked, flush queue
      - tick      -> ping / search / time out (see `SessionInfo::liveness`)
      - our locator changed -> ping so they learn the new coordinates
*/

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace};

use super::info::{Liveness, SessionInfo, SessionState, SessionTimers};
use super::worker::{Reorder, WorkerPool};
use super::SessionError;
use crate::core_router::Outbound;
use crate::core_search::{SearchError, SearchHandle, SearchResult};
use crate::core_switch::Locator;
use crate::crypto::{BoxNonce, BoxPublicKey, CryptoError, Handle, NodeId};
use crate::metrics;
use crate::shutdown::{CancelReason, CancelToken};
use crate::wire::{SessionPing, SwitchPort, TrafficPacket};

/// Everything a session needs from the node, shared by all sessions.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub our_key: BoxPublicKey,
    pub outbound: Outbound,
    pub search: SearchHandle,
    pub pool: WorkerPool,
    pub timers: SessionTimers,
    pub our_mtu: u16,
    pub pending_queue: usize,
    pub inbound_queue: usize,
    /// Node lifetime
    pub token: CancelToken,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Traffic(TrafficPacket),
    Ping(SessionPing),
    Close,
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Published on every state or MTU change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub mtu: u16,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub remote: BoxPublicKey,
    pub handle: Handle,
    pub state: SessionState,
    pub coords: Vec<SwitchPort>,
    pub mtu: u16,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub uptime: Duration,
    pub since_recv: Duration,
}

/// Tells the manager a session is gone.
#[derive(Debug)]
pub(crate) struct SessionClosed {
    pub remote: BoxPublicKey,
    pub handle: Handle,
}

enum CryptoDone {
    Sealed {
        ticket: u64,
        result: Result<Vec<u8>, CryptoError>,
        len: usize,
    },
    Opened {
        ticket: u64,
        nonce: BoxNonce,
        result: Result<Vec<u8>, CryptoError>,
    },
}

type Sealed = (Result<Vec<u8>, CryptoError>, usize);
type Opened = (BoxNonce, Result<Vec<u8>, CryptoError>);

/// Channels handed to the `Conn` of a new session.
pub(crate) struct SessionParts {
    pub tx: mpsc::Sender<SessionCommand>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub status: watch::Receiver<SessionStatus>,
    pub token: CancelToken,
    pub handle: Handle,
}

pub(crate) struct Session {
    ctx: SessionContext,
    info: SessionInfo,
    rx: mpsc::Receiver<SessionCommand>,
    done_tx: mpsc::UnboundedSender<CryptoDone>,
    done_rx: mpsc::UnboundedReceiver<CryptoDone>,
    search_tx: mpsc::Sender<Result<SearchResult, SearchError>>,
    search_rx: mpsc::Receiver<Result<SearchResult, SearchError>>,
    searching: bool,
    inbound: mpsc::Sender<Vec<u8>>,
    status: watch::Sender<SessionStatus>,
    conn_token: CancelToken,
    pending: VecDeque<Vec<u8>>,
    sealing: Reorder<Sealed>,
    opening: Reorder<Opened>,
    locator: watch::Receiver<Locator>,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl Session {
    /// Spawn a session to `remote`. With `coords` the handshake starts
    /// right away; without, the session waits for the remote's ping.
    pub fn spawn(
        ctx: SessionContext,
        remote: BoxPublicKey,
        coords: Option<Vec<SwitchPort>>,
        closed_tx: mpsc::UnboundedSender<SessionClosed>,
    ) -> SessionParts {
        let now = Instant::now();
        let mut info = SessionInfo::new(ctx.our_key, remote, ctx.our_mtu, now);
        if let Some(coords) = coords {
            info.set_coords(coords);
        }
        let handle = info.our_handle();

        let (tx, rx) = mpsc::channel(ctx.inbound_queue.max(16));
        let (inbound_tx, inbound_rx) = mpsc::channel(ctx.inbound_queue);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (search_tx, search_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: info.state(),
            mtu: info.mtu(),
        });
        let conn_token = CancelToken::new();
        let locator = ctx.outbound.switch().subscribe_locator();

        let session = Session {
            ctx,
            info,
            rx,
            done_tx,
            done_rx,
            search_tx,
            search_rx,
            searching: false,
            inbound: inbound_tx,
            status: status_tx,
            conn_token: conn_token.clone(),
            pending: VecDeque::new(),
            sealing: Reorder::default(),
            opening: Reorder::default(),
            locator,
            closed_tx,
        };
        tokio::spawn(session.run());

        SessionParts {
            tx,
            inbound: inbound_rx,
            status: status_rx,
            token: conn_token,
            handle,
        }
    }

    async fn run(mut self) {
        let remote = *self.info.their_key();
        debug!(remote = ?remote, handle = ?self.info.our_handle(), "Session opened");
        let mut tick = tokio::time::interval(self.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = self.locator.borrow_and_update();
        let mut locator_alive = true;
        let node_token = self.ctx.token.clone();

        if self.info.state() == SessionState::Initializing {
            self.send_ping(false).await;
        }

        let reason = loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(SessionCommand::Close) | None => break CancelReason::Explicit,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(done) = self.done_rx.recv() => self.handle_done(done).await,
                Some(result) = self.search_rx.recv() => self.search_finished(result).await,
                _ = tick.tick() => {
                    if !self.maintain().await {
                        break CancelReason::Timeout;
                    }
                }
                changed = self.locator.changed(), if locator_alive => {
                    if changed.is_err() {
                        locator_alive = false;
                    } else if self.info.coords().is_some() {
                        trace!(remote = ?remote, "Coordinates changed, pinging");
                        self.send_ping(false).await;
                    }
                }
                _ = node_token.cancelled() => break CancelReason::Closed,
                _ = self.conn_token.cancelled() => break CancelReason::Explicit,
            }
        };

        self.info.close();
        self.publish();
        // a timed out session looks closed to its reader
        self.conn_token.cancel(match reason {
            CancelReason::Timeout => CancelReason::Closed,
            other => other,
        });
        let _ = self.closed_tx.send(SessionClosed {
            remote,
            handle: self.info.our_handle(),
        });
        info!(
            remote = ?remote,
            reason = ?reason,
            sent = self.info.bytes_sent,
            received = self.info.bytes_recv,
            "Session closed"
        );
    }

    fn tick_interval(&self) -> Duration {
        (self.ctx.timers.ping_interval / 4).max(Duration::from_millis(10))
    }

    fn publish(&self) {
        let status = SessionStatus {
            state: self.info.state(),
            mtu: self.info.mtu(),
        };
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Write { data, reply } => {
                let result = self.write(data).await;
                let _ = reply.send(result);
            }
            SessionCommand::Traffic(packet) => self.receive(packet).await,
            SessionCommand::Ping(ping) => self.handle_ping(ping).await,
            SessionCommand::Snapshot(reply) => {
                let now = Instant::now();
                let _ = reply.send(SessionSnapshot {
                    remote: *self.info.their_key(),
                    handle: self.info.our_handle(),
                    state: self.info.state(),
                    coords: self.info.coords().map(<[_]>::to_vec).unwrap_or_default(),
                    mtu: self.info.mtu(),
                    bytes_sent: self.info.bytes_sent,
                    bytes_recv: self.info.bytes_recv,
                    uptime: now.saturating_duration_since(self.info.created()),
                    since_recv: now.saturating_duration_since(self.info.last_recv()),
                });
            }
            // handled by the run loop
            SessionCommand::Close => {}
        }
    }

    async fn write(&mut self, data: Vec<u8>) -> Result<(), SessionError> {
        if let Err(e) = self.info.check_size(data.len()) {
            metrics::session_dropped("too_big");
            return Err(e);
        }
        if self.info.state() != SessionState::Established {
            if self.pending.len() >= self.ctx.pending_queue {
                self.pending.pop_front();
                metrics::session_dropped("queue_full");
            }
            self.pending.push_back(data);
            return Ok(());
        }
        self.seal(data).await;
        Ok(())
    }

    async fn seal(&mut self, data: Vec<u8>) {
        let (Some(key), Some(handle), Some(coords)) = (
            self.info.shared_key(),
            self.info.their_handle(),
            self.info.coords().map(<[_]>::to_vec),
        ) else {
            return;
        };
        let nonce = self.info.next_nonce();
        let ticket = self.sealing.ticket();
        let len = data.len();
        let done = self.done_tx.clone();
        let job = Box::new(move || {
            let result = key.seal(&data, &nonce).map(|payload| {
                TrafficPacket {
                    coords,
                    handle,
                    nonce,
                    payload,
                }
                .encode()
            });
            let _ = done.send(CryptoDone::Sealed {
                ticket,
                result,
                len,
            });
        });
        if !self.ctx.pool.submit(job).await {
            self.release_sealed(ticket, (Err(CryptoError::SealFailed), len))
                .await;
        }
    }

    async fn receive(&mut self, packet: TrafficPacket) {
        if !self.info.nonce_ok(&packet.nonce) {
            trace!(remote = ?self.info.their_key(), "Dropping replayed packet");
            metrics::session_dropped("replay");
            return;
        }
        let Some(key) = self.info.shared_key() else {
            metrics::session_dropped("no_key");
            return;
        };
        let ticket = self.opening.ticket();
        let nonce = packet.nonce;
        let done = self.done_tx.clone();
        let job = Box::new(move || {
            let result = key.open(&packet.payload, &packet.nonce);
            let _ = done.send(CryptoDone::Opened {
                ticket,
                nonce,
                result,
            });
        });
        if !self.ctx.pool.submit(job).await {
            self.release_opened(ticket, (nonce, Err(CryptoError::OpenFailed)));
        }
    }

    async fn handle_done(&mut self, done: CryptoDone) {
        match done {
            CryptoDone::Sealed {
                ticket,
                result,
                len,
            } => self.release_sealed(ticket, (result, len)).await,
            CryptoDone::Opened {
                ticket,
                nonce,
                result,
            } => self.release_opened(ticket, (nonce, result)),
        }
    }

    async fn release_sealed(&mut self, ticket: u64, item: Sealed) {
        for (result, len) in self.sealing.complete(ticket, item) {
            match result {
                Ok(packet) => match self.ctx.outbound.send_packet(packet).await {
                    Ok(()) => {
                        self.info.bytes_sent += len as u64;
                        metrics::session_bytes("sent", len);
                    }
                    Err(e) => debug!(error = %e, "Failed to send session traffic"),
                },
                Err(e) => debug!(error = %e, "Failed to seal session traffic"),
            }
        }
    }

    fn release_opened(&mut self, ticket: u64, item: Opened) {
        let now = Instant::now();
        for (nonce, result) in self.opening.complete(ticket, item) {
            let payload = match result {
                Ok(payload) => payload,
                Err(_) => {
                    debug!(remote = ?self.info.their_key(), "Undecryptable session packet");
                    metrics::session_dropped("decrypt");
                    continue;
                }
            };
            if !self.info.accept_packet(&nonce, payload.len(), now) {
                trace!(remote = ?self.info.their_key(), "Dropping replayed packet");
                metrics::session_dropped("replay");
                continue;
            }
            metrics::session_bytes("received", payload.len());
            if self.inbound.try_send(payload).is_err() {
                metrics::session_dropped("reader_full");
            }
        }
    }

    async fn handle_ping(&mut self, ping: SessionPing) {
        let Some(outcome) = self.info.handle_ping(&ping, Instant::now()) else {
            trace!(remote = ?self.info.their_key(), "Dropping stale ping");
            metrics::session_dropped("stale_ping");
            return;
        };
        if outcome.send_pong {
            self.send_ping(true).await;
        }
        if outcome.newly_established {
            debug!(remote = ?self.info.their_key(), mtu = self.info.mtu(), "Session established");
        }
        self.publish();
        while let Some(data) = self.pending.pop_front() {
            self.seal(data).await;
        }
    }

    async fn send_ping(&mut self, is_pong: bool) {
        let Some(coords) = self.info.coords().map(<[_]>::to_vec) else {
            return;
        };
        let ping = self.info.make_ping(
            self.ctx.outbound.coords(),
            is_pong,
            unix_millis(),
            Instant::now(),
        );
        let remote = *self.info.their_key();
        if let Err(e) = self
            .ctx
            .outbound
            .send_protocol(&remote, coords, &ping.encode())
            .await
        {
            debug!(remote = ?remote, error = %e, "Failed to send session ping");
        }
        self.publish();
    }

    /// Returns false once the session has timed out.
    async fn maintain(&mut self) -> bool {
        match self.info.liveness(Instant::now(), &self.ctx.timers) {
            Liveness::Quiet => {}
            Liveness::Ping => self.send_ping(false).await,
            Liveness::Search => self.start_search(),
            Liveness::TimedOut => return false,
        }
        true
    }

    fn start_search(&mut self) {
        if self.searching {
            return;
        }
        self.searching = true;
        self.info.search_started();
        let remote = *self.info.their_key();
        debug!(remote = ?remote, "Session silent, searching for new coordinates");
        let search = self.ctx.search.clone();
        let tx = self.search_tx.clone();
        tokio::spawn(async move {
            let result = search
                .search(NodeId::for_key(&remote), NodeId::full_mask())
                .await;
            let _ = tx.send(result).await;
        });
    }

    async fn search_finished(&mut self, result: Result<SearchResult, SearchError>) {
        self.searching = false;
        match result {
            Ok(found) if found.key == *self.info.their_key() => {
                self.info.set_coords(found.coords);
                self.send_ping(false).await;
            }
            Ok(_) => {}
            Err(e) => debug!(remote = ?self.info.their_key(), error = %e, "Session search failed"),
        }
    }
}
