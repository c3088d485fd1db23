//! Graceful shutdown coordination
//!
//! `ShutdownCoordinator` fans a single stop signal out to every actor the
//! node spawns. Actors `subscribe()` before they start their loop and treat
//! any message (or a closed channel) as "stop".
//!
//! `CancelToken` is the level-triggered counterpart used by connections:
//! once cancelled it stays cancelled, and it remembers why.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Graceful,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Why a token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A deadline expired
    Timeout,
    /// The owner (session or node) went away
    Closed,
    /// The holder asked for it
    Explicit,
}

/// Cloneable, sticky cancellation flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the token has fired.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CancelReason::Closed;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    token: CancelToken,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            token: CancelToken::new(),
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Token that fires with `CancelReason::Closed` at shutdown.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Signal every component and wait (up to the timeout) for `tasks`.
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!(tasks = tasks.len(), "Initiating graceful shutdown");

        // no receivers just means nothing is running
        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);
        self.token.cancel(CancelReason::Closed);

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let wait_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        warn!("Component task failed during shutdown: {}", e);
                    }
                }
            }
        };
        if tokio::time::timeout(self.timeout, wait_all).await.is_err() {
            warn!(timeout = ?self.timeout, "Components did not stop in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    pub async fn is_shutting_down(&self) -> bool {
        let state = self.state.read().await;
        *state != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }
}

/// Resolve on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Resolve on Ctrl+C.
#[cfg(windows)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        assert_eq!(coordinator.state().await, ShutdownState::Running);

        coordinator.shutdown(vec![]).await;

        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
        assert!(coordinator.is_shutting_down().await);
        assert_eq!(coordinator.token().reason(), Some(CancelReason::Closed));
    }

    #[tokio::test]
    async fn test_stuck_tasks_are_aborted() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let (guard, dropped) = tokio::sync::oneshot::channel::<()>();
        let stuck = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        tokio::time::timeout(Duration::from_secs(2), coordinator.shutdown(vec![stuck]))
            .await
            .expect("shutdown should give up after its timeout");
        // the guard goes away with the aborted future
        let res = tokio::time::timeout(Duration::from_secs(2), dropped).await;
        assert!(matches!(res, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_cancel_token_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel(CancelReason::Explicit);
        token.cancel(CancelReason::Timeout);

        assert_eq!(waiter.await.unwrap(), CancelReason::Explicit);
        assert_eq!(token.reason(), Some(CancelReason::Explicit));
        // already fired tokens resolve immediately
        assert_eq!(token.cancelled().await, CancelReason::Explicit);
    }
}
