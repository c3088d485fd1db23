/*
    Search - find a node's coordinates from (part of) its NodeID

    Inputs:
      - search(dest, mask)   -> caller waits for a SearchResult
      - DHT responses to our search requests (via the DHT actor)
      - retry tick

    Workflow:
      1. Seed from our own DHT table (lookup with everything=true)
      2. Ask the closest candidate; its answer adds candidates strictly
         between it and the destination
      3. A responder or candidate whose NodeID matches dest under mask ends
         the search successfully
      4. No candidates left, or the deadline passes: the search fails

    A second search for a destination that is already being searched joins
    the first one instead of starting another.
*/

pub mod state;

pub use state::{SearchResult, SearchState};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::core_dht::{DhtError, DhtHandle, SearchResponse};
use crate::crypto::{BoxPublicKey, NodeId};
use crate::metrics;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("search timed out")]
    Timeout,

    #[error("search ran out of nodes to ask")]
    DeadEnd,

    #[error("search stopped")]
    Stopped,

    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
}

type Waiter = oneshot::Sender<Result<SearchResult, SearchError>>;

#[derive(Debug)]
enum SearchCommand {
    Start {
        dest: NodeId,
        mask: NodeId,
        reply: Waiter,
    },
    Seeded {
        dest: NodeId,
        seeds: Result<Vec<crate::wire::DhtResponseInfo>, DhtError>,
    },
    Outstanding(oneshot::Sender<Vec<NodeId>>),
}

#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub width: usize,
    pub retry: Duration,
    pub timeout: Duration,
}

impl From<&SessionConfig> for SearchSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            width: config.search_width,
            retry: config.search_retry,
            timeout: config.search_timeout,
        }
    }
}

#[derive(Clone)]
pub struct SearchHandle {
    tx: mpsc::Sender<SearchCommand>,
}

impl SearchHandle {
    pub fn new(
        our_key: BoxPublicKey,
        settings: SearchSettings,
        dht: DhtHandle,
        responses: mpsc::UnboundedReceiver<SearchResponse>,
        shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let searcher = Searcher {
            our_key,
            settings,
            dht,
            rx,
            self_tx: tx.clone(),
            responses,
            searches: HashMap::new(),
        };
        let handle = tokio::spawn(searcher.run(shutdown));
        (Self { tx }, handle)
    }

    /// Find the node whose NodeID equals `dest` on the bits set in `mask`.
    pub async fn search(&self, dest: NodeId, mask: NodeId) -> Result<SearchResult, SearchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SearchCommand::Start { dest, mask, reply })
            .await
            .map_err(|_| SearchError::Stopped)?;
        rx.await.map_err(|_| SearchError::Stopped)?
    }

    /// Destinations currently being searched for.
    pub async fn outstanding(&self) -> Result<Vec<NodeId>, SearchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SearchCommand::Outstanding(reply))
            .await
            .map_err(|_| SearchError::Stopped)?;
        rx.await.map_err(|_| SearchError::Stopped)
    }
}

struct Search {
    /// None until the DHT answered our seed lookup
    state: Option<SearchState>,
    mask: NodeId,
    started: Instant,
    waiters: Vec<Waiter>,
}

struct Searcher {
    our_key: BoxPublicKey,
    settings: SearchSettings,
    dht: DhtHandle,
    rx: mpsc::Receiver<SearchCommand>,
    self_tx: mpsc::Sender<SearchCommand>,
    responses: mpsc::UnboundedReceiver<SearchResponse>,
    searches: HashMap<NodeId, Search>,
}

impl Searcher {
    async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut tick = tokio::time::interval(self.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(res) = self.responses.recv() => self.handle_response(res).await,
                _ = tick.tick() => self.maintain().await,
                _ = shutdown.recv() => break,
            }
        }
        for (_, search) in self.searches.drain() {
            for waiter in search.waiters {
                let _ = waiter.send(Err(SearchError::Stopped));
            }
        }
        debug!("Search stopped");
    }

    fn tick_interval(&self) -> Duration {
        (self.settings.retry / 4).max(Duration::from_millis(10))
    }

    async fn handle_command(&mut self, cmd: SearchCommand) {
        match cmd {
            SearchCommand::Start { dest, mask, reply } => {
                if let Some(search) = self.searches.get_mut(&dest) {
                    trace!(dest = ?dest, "Joining outstanding search");
                    search.waiters.push(reply);
                    return;
                }
                debug!(dest = ?dest, "Starting search");
                self.searches.insert(
                    dest,
                    Search {
                        state: None,
                        mask,
                        started: Instant::now(),
                        waiters: vec![reply],
                    },
                );
                // the DHT may be busy sending to the switch; don't block on it
                let dht = self.dht.clone();
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    let seeds = dht.lookup(dest, true).await;
                    let _ = tx.send(SearchCommand::Seeded { dest, seeds }).await;
                });
            }
            SearchCommand::Seeded { dest, seeds } => {
                let Some(search) = self.searches.get_mut(&dest) else {
                    return;
                };
                let seeds = match seeds {
                    Ok(seeds) => seeds,
                    Err(e) => {
                        self.finish(&dest, Err(e.into()));
                        return;
                    }
                };
                let state = SearchState::new(
                    dest,
                    search.mask,
                    self.settings.width,
                    self.our_key,
                    seeds,
                    search.started,
                );
                if let Some(found) = state.seeded_match() {
                    self.finish(&dest, Ok(found));
                    return;
                }
                search.state = Some(state);
                self.step(&dest).await;
            }
            SearchCommand::Outstanding(reply) => {
                let _ = reply.send(self.searches.keys().copied().collect());
            }
        }
    }

    async fn handle_response(&mut self, res: SearchResponse) {
        let dest = res.res.dest;
        let Some(state) = self
            .searches
            .get_mut(&dest)
            .and_then(|s| s.state.as_mut())
        else {
            trace!(dest = ?dest, "Response for unknown search");
            return;
        };
        match state.handle_response(&res.from, &res.res) {
            Some(found) => self.finish(&dest, Ok(found)),
            None => self.step(&dest).await,
        }
    }

    /// Ask the next candidate, or fail the search if there is none.
    async fn step(&mut self, dest: &NodeId) {
        let Some(state) = self.searches.get_mut(dest).and_then(|s| s.state.as_mut()) else {
            return;
        };
        match state.next_step(Instant::now()) {
            Some(next) => {
                trace!(dest = ?dest, via = ?next.key, "Search step");
                if let Err(e) = self.dht.search_ping(next.key, next.coords, *dest).await {
                    self.finish(dest, Err(e.into()));
                }
            }
            None => self.finish(dest, Err(SearchError::DeadEnd)),
        }
    }

    async fn maintain(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut due = Vec::new();
        for (dest, search) in &self.searches {
            if now.saturating_duration_since(search.started) >= self.settings.timeout {
                expired.push(*dest);
            } else if let Some(state) = &search.state {
                if state.step_due(now, self.settings.retry) {
                    due.push(*dest);
                }
            }
        }
        for dest in expired {
            self.finish(&dest, Err(SearchError::Timeout));
        }
        for dest in due {
            self.step(&dest).await;
        }
    }

    fn finish(&mut self, dest: &NodeId, result: Result<SearchResult, SearchError>) {
        let Some(search) = self.searches.remove(dest) else {
            return;
        };
        match &result {
            Ok(found) => {
                debug!(dest = ?dest, key = ?found.key, coords = ?found.coords, "Search found node");
                metrics::search_finished("found");
            }
            Err(SearchError::Timeout) => metrics::search_finished("timeout"),
            Err(e) => {
                debug!(dest = ?dest, error = %e, "Search failed");
                metrics::search_finished("failed");
            }
        }
        for waiter in search.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
