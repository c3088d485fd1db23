/*
  LinkManager - sockets in, links out

  Owns the listening sockets and outgoing dials. Every connected stream is
  handed to `establish` and, once the handshake succeeds, to its own link task.
  The manager is ignorant of the tree and of sessions; it only knows
  addresses, streams and the inbound allow-list.

  Inputs:
    - listen(uri)          -> bind, spawn accept loop
    - dial(uri)            -> connect + handshake, returns the switch port
    - keep_peer(uri)       -> dial now and re-dial whenever the link drops
    - connect_stream(s)    -> run a link over any byte stream (tests, pipes)

  Outputs:
    Running link tasks, and the `arbor_links_active` gauge.

  URIs have the form `tcp://host:port`.
*/

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::link::{establish, EstablishedLink, LinkContext};
use super::LinkError;
use crate::crypto::BoxPublicKey;
use crate::metrics;
use crate::wire::SwitchPort;

/// Box keys allowed to connect in. Empty means everyone.
#[derive(Clone, Default, Debug)]
pub struct AllowedKeys(Arc<RwLock<HashSet<BoxPublicKey>>>);

impl AllowedKeys {
    pub fn new(keys: impl IntoIterator<Item = BoxPublicKey>) -> Self {
        Self(Arc::new(RwLock::new(keys.into_iter().collect())))
    }

    pub fn is_allowed(&self, key: &BoxPublicKey) -> bool {
        let keys = self.0.read().unwrap_or_else(|e| e.into_inner());
        keys.is_empty() || keys.contains(key)
    }

    pub fn add(&self, key: BoxPublicKey) -> bool {
        self.0.write().unwrap_or_else(|e| e.into_inner()).insert(key)
    }

    pub fn remove(&self, key: &BoxPublicKey) -> bool {
        self.0.write().unwrap_or_else(|e| e.into_inner()).remove(key)
    }

    pub fn list(&self) -> Vec<BoxPublicKey> {
        let mut keys: Vec<BoxPublicKey> = self
            .0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        keys.sort();
        keys
    }
}

/// Split `tcp://host:port` into the socket address part.
pub fn parse_uri(uri: &str) -> Result<String, LinkError> {
    let (scheme, addr) = uri
        .split_once("://")
        .ok_or_else(|| LinkError::InvalidUri(uri.to_string()))?;
    if scheme != "tcp" || addr.is_empty() || !addr.contains(':') {
        return Err(LinkError::InvalidUri(uri.to_string()));
    }
    Ok(addr.to_string())
}

pub struct LinkManager {
    ctx: LinkContext,
    active: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkManager {
    pub fn new(ctx: LinkContext) -> Self {
        Self {
            ctx,
            active: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn allowed_keys(&self) -> &AllowedKeys {
        &self.ctx.allowed
    }

    pub fn active_links(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind `uri` and accept links on it until shutdown. Returns the bound
    /// address (useful with port 0).
    pub async fn listen(&self, uri: &str) -> Result<SocketAddr, LinkError> {
        let addr = parse_uri(uri)?;
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "Listening for links");

        let ctx = self.ctx.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    r = listener.accept() => r,
                    _ = ctx.token.cancelled() => break,
                };
                match accepted {
                    Ok((socket, peer_addr)) => {
                        let _ = socket.set_nodelay(true);
                        let ctx = ctx.clone();
                        let active = active.clone();
                        tokio::spawn(async move {
                            let remote = format!("tcp://{}", peer_addr);
                            match establish(socket, ctx, remote, true).await {
                                Ok(link) => run_link(link, active).await,
                                Err(e) => debug!(remote = %peer_addr, error = %e, "Inbound link rejected"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
            debug!(addr = %local, "Listener stopped");
        });
        self.tasks.lock().await.push(task);
        Ok(local)
    }

    /// Connect to `uri` once. Returns after the handshake with the new port.
    pub async fn dial(&self, uri: &str) -> Result<SwitchPort, LinkError> {
        let link = connect(&self.ctx, uri).await?;
        let port = link.port();
        let task = tokio::spawn(run_link(link, self.active.clone()));
        self.tasks.lock().await.push(task);
        Ok(port)
    }

    /// Keep a link to `uri` up, re-dialing `retry` after each failure or
    /// disconnect.
    pub async fn keep_peer(&self, uri: String, retry: Duration) {
        let ctx = self.ctx.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            loop {
                match connect(&ctx, &uri).await {
                    Ok(link) => run_link(link, active.clone()).await,
                    Err(e) => debug!(uri = %uri, error = %e, "Dial failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = ctx.token.cancelled() => break,
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Run a link over an already connected stream.
    pub async fn connect_stream<S>(
        &self,
        stream: S,
        remote: String,
        inbound: bool,
    ) -> Result<SwitchPort, LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let link = establish(stream, self.ctx.clone(), remote, inbound).await?;
        let port = link.port();
        let task = tokio::spawn(run_link(link, self.active.clone()));
        self.tasks.lock().await.push(task);
        Ok(port)
    }

    /// Tasks to await at shutdown. Links stop on the node token.
    pub async fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        std::mem::take(&mut *tasks)
    }
}

async fn connect(ctx: &LinkContext, uri: &str) -> Result<EstablishedLink<TcpStream>, LinkError> {
    let addr = parse_uri(uri)?;
    let socket = TcpStream::connect(&addr).await?;
    let _ = socket.set_nodelay(true);
    establish(socket, ctx.clone(), uri.to_string(), false).await
}

async fn run_link<S>(link: EstablishedLink<S>, active: Arc<AtomicUsize>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let count = active.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_active_links(count);
    // errors are logged by the link itself
    let _ = link.run().await;
    let count = active.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::set_active_links(count);
}
