//! Application side of a session
//!
//! A `Conn` sends and receives whole datagrams. Reads and writes honour an
//! optional deadline and stop when the session or the node goes away; the
//! error says which of the three happened.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;

use super::info::SessionState;
use super::session::{SessionCommand, SessionParts, SessionSnapshot, SessionStatus};
use super::SessionError;
use crate::address::Address;
use crate::crypto::{BoxPublicKey, Handle};
use crate::shutdown::{CancelReason, CancelToken};

impl From<CancelReason> for SessionError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Timeout => SessionError::Timeout,
            CancelReason::Closed => SessionError::Closed,
            CancelReason::Explicit => SessionError::Cancelled,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub struct Conn {
    remote: BoxPublicKey,
    handle: Handle,
    tx: mpsc::Sender<SessionCommand>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    status: watch::Receiver<SessionStatus>,
    token: CancelToken,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl Conn {
    pub(crate) fn new(remote: BoxPublicKey, parts: SessionParts) -> Self {
        Self {
            remote,
            handle: parts.handle,
            tx: parts.tx,
            inbound: Mutex::new(parts.inbound),
            status: parts.status,
            token: parts.token,
            read_deadline: StdMutex::new(None),
            write_deadline: StdMutex::new(None),
        }
    }

    pub fn remote_key(&self) -> &BoxPublicKey {
        &self.remote
    }

    pub fn remote_address(&self) -> Address {
        Address::for_key(&self.remote)
    }

    /// Our handle for this session.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Largest datagram `write` accepts right now.
    pub fn mtu(&self) -> u16 {
        self.status.borrow().mtu
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    fn read_deadline(&self) -> Option<Instant> {
        *self.read_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_deadline(&self) -> Option<Instant> {
        *self.write_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next datagram from the remote node, in nonce order.
    pub async fn read(&self) -> Result<Vec<u8>, SessionError> {
        if let Some(reason) = self.token.reason() {
            return Err(reason.into());
        }
        let deadline = self.read_deadline();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            data = inbound.recv() => data.ok_or_else(|| {
                self.token.reason().map_or(SessionError::Closed, SessionError::from)
            }),
            reason = self.token.cancelled() => Err(reason.into()),
            _ = sleep_until(deadline) => Err(SessionError::Timeout),
        }
    }

    /// Queue one datagram. Fails with `PacketTooBig` if it exceeds the MTU.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if let Some(reason) = self.token.reason() {
            return Err(reason.into());
        }
        let max = self.mtu();
        if data.len() > max as usize {
            return Err(SessionError::PacketTooBig { max });
        }

        let deadline = self.write_deadline();
        let (reply, rx) = oneshot::channel();
        let send = async {
            self.tx
                .send(SessionCommand::Write {
                    data: data.to_vec(),
                    reply,
                })
                .await
                .map_err(|_| SessionError::Closed)?;
            rx.await.map_err(|_| SessionError::Closed)?
        };
        tokio::select! {
            result = send => result,
            reason = self.token.cancelled() => Err(reason.into()),
            _ = sleep_until(deadline) => Err(SessionError::Timeout),
        }
    }

    /// Wait until the handshake completes, or fail after `limit`.
    pub(crate) async fn wait_established(&self, limit: Duration) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                match status.borrow_and_update().state {
                    SessionState::Established => return Ok(()),
                    SessionState::Closed => return Err(SessionError::Closed),
                    _ => {}
                }
                if status.changed().await.is_err() {
                    return Err(SessionError::Closed);
                }
            }
        };
        tokio::select! {
            result = wait => result,
            reason = self.token.cancelled() => Err(reason.into()),
            _ = tokio::time::sleep(limit) => Err(SessionError::HandshakeTimeout),
        }
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Snapshot(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Close the session. Pending reads and writes fail with `Cancelled`.
    pub fn close(&self) {
        self.token.cancel(CancelReason::Explicit);
        let _ = self.tx.try_send(SessionCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}
