//! Crypto worker pool
//!
//! Sealing and opening session traffic runs on a fixed set of workers fed
//! from one bounded queue, so a burst of packets applies back-pressure
//! instead of spawning a task per packet. Results come back out of order;
//! `Reorder` puts them back into submission order for the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::shutdown::ShutdownCoordinator;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn `workers` workers sharing one queue.
    pub fn new(
        workers: usize,
        shutdown: &ShutdownCoordinator,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 64);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| {
                let rx = rx.clone();
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            job = async { rx.lock().await.recv().await } => job,
                            _ = stop.recv() => None,
                        };
                        match job {
                            Some(job) => job(),
                            None => break,
                        }
                    }
                    debug!(worker = id, "Crypto worker stopped");
                })
            })
            .collect();
        (Self { tx }, handles)
    }

    /// Queue a job, waiting for room if the pool is saturated.
    /// Returns false once the pool has stopped.
    pub async fn submit(&self, job: Job) -> bool {
        self.tx.send(job).await.is_ok()
    }
}

/// Releases results in ticket order.
#[derive(Debug)]
pub struct Reorder<T> {
    next_ticket: u64,
    next_release: u64,
    ready: BTreeMap<u64, T>,
}

impl<T> Default for Reorder<T> {
    fn default() -> Self {
        Self {
            next_ticket: 0,
            next_release: 0,
            ready: BTreeMap::new(),
        }
    }
}

impl<T> Reorder<T> {
    pub fn ticket(&mut self) -> u64 {
        let t = self.next_ticket;
        self.next_ticket += 1;
        t
    }

    /// Hand in the result for `ticket`; returns everything now releasable.
    pub fn complete(&mut self, ticket: u64, item: T) -> Vec<T> {
        self.ready.insert(ticket, item);
        let mut out = Vec::new();
        while let Some(item) = self.ready.remove(&self.next_release) {
            out.push(item);
            self.next_release += 1;
        }
        out
    }

    /// Tickets issued but not yet released.
    pub fn in_flight(&self) -> u64 {
        self.next_ticket - self.next_release
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recv_unbounded_timeout, DEFAULT_TEST_TIMEOUT};
    use std::time::Duration;

    #[test]
    fn test_reorder_releases_in_order() {
        let mut r = Reorder::default();
        let a = r.ticket();
        let b = r.ticket();
        let c = r.ticket();
        assert!(r.complete(c, "c").is_empty());
        assert!(r.complete(b, "b").is_empty());
        assert_eq!(r.in_flight(), 3);
        assert_eq!(r.complete(a, "a"), vec!["a", "b", "c"]);
        assert_eq!(r.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_runs_jobs_and_reorders() {
        let stop = ShutdownCoordinator::new(Duration::from_secs(1));
        let (pool, _handles) = WorkerPool::new(4, &stop);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let mut reorder = Reorder::default();
        for i in 0..50u64 {
            let ticket = reorder.ticket();
            let done_tx = done_tx.clone();
            assert!(
                pool.submit(Box::new(move || {
                    let _ = done_tx.send((ticket, i * 2));
                }))
                .await
            );
        }

        let mut released = Vec::new();
        while released.len() < 50 {
            let (ticket, value) = recv_unbounded_timeout(&mut done_rx, DEFAULT_TEST_TIMEOUT)
                .await
                .unwrap();
            released.extend(reorder.complete(ticket, value));
        }
        let expected: Vec<u64> = (0..50).map(|i| i * 2).collect();
        assert_eq!(released, expected);
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let stop = ShutdownCoordinator::new(Duration::from_secs(1));
        let (_pool, handles) = WorkerPool::new(2, &stop);
        stop.shutdown(vec![]).await;
        for h in handles {
            h.await.unwrap();
        }
    }
}
