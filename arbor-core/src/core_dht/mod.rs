/*
    DHT - ring of NodeIDs used to find a node's coordinates

    The actor owns a `DhtTable`. Directly linked peers are fed in by their
    links (once they share our root); everything else is learned from
    lookup responses.

    Workflow:
      - InsertPeer   -> insert, ping the peer to learn its neighbourhood
      - Request      -> answer with candidates between us and the target,
                        remember the requester if it is useful
      - Response     -> only if we asked; insert responder and any candidate
                        that beats our successor/predecessor, ping those;
                        responses to search pings go to the search actor
      - tick         -> evict silent entries, ping successor (target: its
                        predecessor slot) and predecessor (target: us)

    Requests and responses travel as protocol traffic through `Outbound`.
*/

pub mod ring;
pub mod table;

pub use ring::{clockwise, closer_to, dht_ordered, ring_gap};
pub use table::{DhtInfo, DhtSettings, DhtTable, PingRequest, ResponseOutcome};

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::DhtConfig;
use crate::core_router::Outbound;
use crate::crypto::{BoxPublicKey, NodeId};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use crate::wire::{DhtRequest, DhtResponse, DhtResponseInfo, SwitchPort};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("DHT stopped")]
    Stopped,
}

/// A response to a request the search actor asked us to send.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub from: BoxPublicKey,
    pub res: DhtResponse,
}

#[derive(Debug)]
pub enum DhtCommand {
    InsertPeer {
        key: BoxPublicKey,
        coords: Vec<SwitchPort>,
    },
    Request {
        from: BoxPublicKey,
        req: DhtRequest,
    },
    Response {
        from: BoxPublicKey,
        res: DhtResponse,
    },
    Lookup {
        target: NodeId,
        everything: bool,
        reply: oneshot::Sender<Vec<DhtResponseInfo>>,
    },
    /// Send a request whose response is forwarded to the search actor
    SearchPing {
        key: BoxPublicKey,
        coords: Vec<SwitchPort>,
        target: NodeId,
    },
    Snapshot(oneshot::Sender<DhtSnapshot>),
}

#[derive(Debug, Clone)]
pub struct DhtEntryInfo {
    pub key: BoxPublicKey,
    pub node_id: NodeId,
    pub coords: Vec<SwitchPort>,
    pub since_heard: Duration,
    pub missed_pings: u32,
}

#[derive(Debug, Clone)]
pub struct DhtSnapshot {
    pub node_id: NodeId,
    pub successor: Option<BoxPublicKey>,
    pub predecessor: Option<BoxPublicKey>,
    /// Entries in clockwise order starting after us
    pub entries: Vec<DhtEntryInfo>,
}

#[derive(Clone)]
pub struct DhtHandle {
    tx: mpsc::Sender<DhtCommand>,
}

impl DhtHandle {
    pub fn new(
        key: BoxPublicKey,
        config: &DhtConfig,
        outbound: Outbound,
        search_tx: mpsc::UnboundedSender<SearchResponse>,
        shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let settings = DhtSettings {
            lookup_size: config.lookup_size,
            max_entries: config.max_entries,
            max_pings: config.max_pings,
            silence_timeout: config.silence_timeout,
            max_ping_throttle: config.max_ping_throttle,
        };
        let dht = Dht {
            table: DhtTable::new(key, settings),
            rx,
            outbound,
            search_tx,
            maintenance_interval: config.maintenance_interval,
        };
        let handle = tokio::spawn(dht.run(shutdown));
        (Self { tx }, handle)
    }

    /// Called by links for peers on our tree. Dropped if the DHT is busy;
    /// the next announcement retries.
    pub fn insert_peer(&self, key: BoxPublicKey, coords: Vec<SwitchPort>) {
        let _ = self.tx.try_send(DhtCommand::InsertPeer { key, coords });
    }

    pub async fn handle_request(&self, from: BoxPublicKey, req: DhtRequest) -> Result<(), DhtError> {
        self.tx
            .send(DhtCommand::Request { from, req })
            .await
            .map_err(|_| DhtError::Stopped)
    }

    pub async fn handle_response(&self, from: BoxPublicKey, res: DhtResponse) -> Result<(), DhtError> {
        self.tx
            .send(DhtCommand::Response { from, res })
            .await
            .map_err(|_| DhtError::Stopped)
    }

    pub async fn lookup(
        &self,
        target: NodeId,
        everything: bool,
    ) -> Result<Vec<DhtResponseInfo>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DhtCommand::Lookup {
                target,
                everything,
                reply,
            })
            .await
            .map_err(|_| DhtError::Stopped)?;
        rx.await.map_err(|_| DhtError::Stopped)
    }

    pub async fn search_ping(
        &self,
        key: BoxPublicKey,
        coords: Vec<SwitchPort>,
        target: NodeId,
    ) -> Result<(), DhtError> {
        self.tx
            .send(DhtCommand::SearchPing {
                key,
                coords,
                target,
            })
            .await
            .map_err(|_| DhtError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<DhtSnapshot, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DhtCommand::Snapshot(reply))
            .await
            .map_err(|_| DhtError::Stopped)?;
        rx.await.map_err(|_| DhtError::Stopped)
    }
}

struct Dht {
    table: DhtTable,
    rx: mpsc::Receiver<DhtCommand>,
    outbound: Outbound,
    search_tx: mpsc::UnboundedSender<SearchResponse>,
    maintenance_interval: Duration,
}

impl Dht {
    async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut tick = tokio::time::interval(self.maintenance_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(node_id = ?self.table.node_id(), "DHT started");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = tick.tick() => self.maintain().await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("DHT stopped");
    }

    async fn handle_command(&mut self, cmd: DhtCommand) {
        let now = Instant::now();
        match cmd {
            DhtCommand::InsertPeer { key, coords } => {
                self.table.insert(key, coords, now);
                if let Some(ping) = self.table.peer_ping(&key, now) {
                    self.send_request(ping, false).await;
                }
            }
            DhtCommand::Request { from, req } => {
                metrics::dht_message("request_in");
                let infos = self
                    .table
                    .handle_request(from, req.coords.clone(), &req.dest, now);
                let res = DhtResponse {
                    coords: self.outbound.coords(),
                    dest: req.dest,
                    infos,
                };
                if let Err(e) = self
                    .outbound
                    .send_protocol(&from, req.coords, &res.encode())
                    .await
                {
                    debug!(error = %e, "Failed to send DHT response");
                } else {
                    metrics::dht_message("response_out");
                }
            }
            DhtCommand::Response { from, res } => {
                metrics::dht_message("response_in");
                let outcome = self.table.handle_response(from, &res, now);
                if !outcome.expected {
                    trace!(from = ?from, "Unsolicited DHT response");
                    return;
                }
                for ping in outcome.pings {
                    self.send_request(ping, false).await;
                }
                if outcome.for_search {
                    let _ = self.search_tx.send(SearchResponse { from, res });
                }
            }
            DhtCommand::Lookup {
                target,
                everything,
                reply,
            } => {
                let infos = self
                    .table
                    .lookup(&target, everything)
                    .iter()
                    .map(DhtInfo::as_response_info)
                    .collect();
                let _ = reply.send(infos);
            }
            DhtCommand::SearchPing {
                key,
                coords,
                target,
            } => {
                self.send_request(
                    PingRequest {
                        key,
                        coords,
                        target,
                    },
                    true,
                )
                .await;
            }
            DhtCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(now));
            }
        }
        metrics::set_dht_entries(self.table.len());
    }

    async fn send_request(&mut self, ping: PingRequest, for_search: bool) {
        self.table
            .request_sent(ping.key, ping.target, for_search, Instant::now());
        let req = DhtRequest {
            coords: self.outbound.coords(),
            dest: ping.target,
        };
        match self
            .outbound
            .send_protocol(&ping.key, ping.coords, &req.encode())
            .await
        {
            Ok(()) => metrics::dht_message("request_out"),
            Err(e) => debug!(error = %e, "Failed to send DHT request"),
        }
    }

    async fn maintain(&mut self) {
        let pings = self.table.maintain(Instant::now());
        for ping in pings {
            self.send_request(ping, false).await;
        }
        metrics::set_dht_entries(self.table.len());
    }

    fn snapshot(&self, now: Instant) -> DhtSnapshot {
        let me = *self.table.node_id();
        let mut entries: Vec<DhtEntryInfo> = self
            .table
            .entries()
            .map(|info| DhtEntryInfo {
                key: info.key,
                node_id: info.node_id,
                coords: info.coords.clone(),
                since_heard: now.saturating_duration_since(info.recv),
                missed_pings: info.pings,
            })
            .collect();
        entries.sort_by_key(|e| clockwise(&me, &e.node_id));
        DhtSnapshot {
            node_id: me,
            successor: self.table.successor().map(|i| i.key),
            predecessor: self.table.predecessor().map(|i| i.key),
            entries,
        }
    }
}
