//! Per-session state, free of any I/O.
//!
//! The session actor owns exactly one `SessionInfo` and drives it with
//! pings, traffic nonces and the clock. Everything here is synchronous so
//! the replay and escalation rules can be tested directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::SessionError;
use crate::crypto::{BoxKeyPair, BoxNonce, BoxPublicKey, Handle, SharedKey};
use crate::wire::{SessionPing, SwitchPort, DEFAULT_SESSION_MTU};

/// Smallest MTU a session will ever negotiate.
pub const MIN_SESSION_MTU: u16 = DEFAULT_SESSION_MTU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No coordinates for the remote node yet
    Uninitialized,
    /// Ping sent, nothing heard back
    Initializing,
    Established,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Established => "established",
            SessionState::Closed => "closed",
        }
    }
}

/// Sliding window over received nonces. Anything newer than the highest
/// nonce seen is fine; older nonces are fine once, if they are within the
/// window.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<BoxNonce>,
    /// bit n set: nonce `highest - n` was seen
    seen: u64,
}

impl ReplayWindow {
    pub fn check(&self, nonce: &BoxNonce) -> bool {
        let Some(highest) = &self.highest else {
            return true;
        };
        let diff = nonce.minus(highest);
        if diff > 0 {
            return true;
        }
        let back = (-diff) as u64;
        back < 64 && self.seen & (1 << back) == 0
    }

    /// Record `nonce`. Returns false (and changes nothing) for a replay.
    pub fn accept(&mut self, nonce: &BoxNonce) -> bool {
        if !self.check(nonce) {
            return false;
        }
        let Some(highest) = &self.highest else {
            self.highest = Some(*nonce);
            self.seen = 1;
            return true;
        };
        let diff = nonce.minus(highest);
        if diff > 0 {
            self.seen = if diff < 64 { self.seen << diff } else { 0 };
            self.seen |= 1;
            self.highest = Some(*nonce);
        } else {
            self.seen |= 1 << (-diff) as u64;
        }
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What the session should do after an accepted ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingOutcome {
    pub send_pong: bool,
    pub newly_established: bool,
}

/// What the clock says the session should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Quiet,
    Ping,
    Search,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimers {
    pub timeout: Duration,
    pub ping_after: Duration,
    pub search_after: Duration,
    pub ping_interval: Duration,
}

pub struct SessionInfo {
    our_key: BoxPublicKey,
    their_key: BoxPublicKey,
    our_handle: Handle,
    their_handle: Option<Handle>,
    ephemeral: BoxKeyPair,
    their_session_key: Option<BoxPublicKey>,
    shared: Option<Arc<SharedKey>>,
    send_nonce: BoxNonce,
    replay: ReplayWindow,
    coords: Option<Vec<SwitchPort>>,
    our_mtu: u16,
    their_mtu: u16,
    our_tstamp: i64,
    their_tstamp: Option<i64>,
    state: SessionState,
    created: Instant,
    last_recv: Instant,
    /// First ping sent since we last heard from them
    ping_since: Option<Instant>,
    last_ping: Option<Instant>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

impl SessionInfo {
    pub fn new(our_key: BoxPublicKey, their_key: BoxPublicKey, our_mtu: u16, now: Instant) -> Self {
        let mut send_nonce = BoxNonce::random();
        send_nonce.set_parity(our_key > their_key);
        Self {
            our_key,
            their_key,
            our_handle: Handle::random(),
            their_handle: None,
            ephemeral: BoxKeyPair::generate(),
            their_session_key: None,
            shared: None,
            send_nonce,
            replay: ReplayWindow::default(),
            coords: None,
            our_mtu: our_mtu.max(MIN_SESSION_MTU),
            their_mtu: MIN_SESSION_MTU,
            our_tstamp: 0,
            their_tstamp: None,
            state: SessionState::Uninitialized,
            created: now,
            last_recv: now,
            ping_since: None,
            last_ping: None,
            bytes_sent: 0,
            bytes_recv: 0,
        }
    }

    pub fn their_key(&self) -> &BoxPublicKey {
        &self.their_key
    }

    pub fn our_handle(&self) -> Handle {
        self.our_handle
    }

    pub fn their_handle(&self) -> Option<Handle> {
        self.their_handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn coords(&self) -> Option<&[SwitchPort]> {
        self.coords.as_deref()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    pub fn shared_key(&self) -> Option<Arc<SharedKey>> {
        self.shared.clone()
    }

    /// Negotiated MTU: the smaller of both sides, never below 1280.
    pub fn mtu(&self) -> u16 {
        self.our_mtu.min(self.their_mtu).max(MIN_SESSION_MTU)
    }

    pub fn check_size(&self, len: usize) -> Result<(), SessionError> {
        let max = self.mtu();
        if len > max as usize {
            return Err(SessionError::PacketTooBig { max });
        }
        Ok(())
    }

    /// Install coordinates learned from a search.
    pub fn set_coords(&mut self, coords: Vec<SwitchPort>) {
        self.coords = Some(coords);
        if self.state == SessionState::Uninitialized {
            self.state = SessionState::Initializing;
        }
    }

    /// Build a ping (or pong) carrying our current coordinates.
    /// Timestamps are unix milliseconds, forced to increase.
    pub fn make_ping(
        &mut self,
        our_coords: Vec<SwitchPort>,
        is_pong: bool,
        unix_ms: i64,
        now: Instant,
    ) -> SessionPing {
        self.our_tstamp = unix_ms.max(self.our_tstamp + 1);
        if !is_pong {
            self.last_ping = Some(now);
            if self.ping_since.is_none() {
                self.ping_since = Some(now);
            }
        }
        SessionPing {
            handle: self.our_handle,
            session_key: self.ephemeral.public,
            tstamp: self.our_tstamp,
            coords: our_coords,
            is_pong,
            mtu: self.our_mtu,
        }
    }

    /// Apply a ping from the remote node. `None` means it was a replay.
    pub fn handle_ping(&mut self, ping: &SessionPing, now: Instant) -> Option<PingOutcome> {
        if let Some(last) = self.their_tstamp {
            if ping.tstamp <= last {
                return None;
            }
        }
        if self.their_session_key != Some(ping.session_key) {
            self.their_session_key = Some(ping.session_key);
            self.shared = Some(Arc::new(SharedKey::derive(
                &self.ephemeral.secret,
                &ping.session_key,
            )));
            self.replay.reset();
        }
        self.their_handle = Some(ping.handle);
        self.their_mtu = ping.mtu.max(MIN_SESSION_MTU);
        self.coords = Some(ping.coords.clone());
        self.their_tstamp = Some(ping.tstamp);
        self.mark_recv(now);

        let newly_established = self.state != SessionState::Established;
        self.state = SessionState::Established;
        Some(PingOutcome {
            send_pong: !ping.is_pong,
            newly_established,
        })
    }

    /// Nonce for the next outbound packet.
    pub fn next_nonce(&mut self) -> BoxNonce {
        self.send_nonce.advance();
        self.send_nonce
    }

    /// Cheap pre-check before spending a worker on decryption.
    pub fn nonce_ok(&self, nonce: &BoxNonce) -> bool {
        self.replay.check(nonce)
    }

    /// Record an authenticated inbound packet.
    pub fn accept_packet(&mut self, nonce: &BoxNonce, len: usize, now: Instant) -> bool {
        if !self.replay.accept(nonce) {
            return false;
        }
        self.bytes_recv += len as u64;
        self.mark_recv(now);
        true
    }

    fn mark_recv(&mut self, now: Instant) {
        self.last_recv = now;
        self.ping_since = None;
    }

    /// Two-tier escalation: ping after `ping_after` of silence, search once
    /// a ping has gone unanswered for `search_after`, give up after
    /// `timeout`.
    pub fn liveness(&self, now: Instant, timers: &SessionTimers) -> Liveness {
        let silent = now.saturating_duration_since(self.last_recv);
        if silent > timers.timeout {
            return Liveness::TimedOut;
        }
        if self.coords.is_none() {
            return Liveness::Search;
        }
        let handshaking = self.state != SessionState::Established;
        if !handshaking && silent < timers.ping_after {
            return Liveness::Quiet;
        }
        if let Some(since) = self.ping_since {
            if now.saturating_duration_since(since) >= timers.search_after {
                return Liveness::Search;
            }
        }
        let ping_due = self
            .last_ping
            .map_or(true, |at| now.saturating_duration_since(at) >= timers.ping_interval);
        if ping_due {
            Liveness::Ping
        } else {
            Liveness::Quiet
        }
    }

    /// A search was started on our behalf; the unanswered-ping clock
    /// starts over.
    pub fn search_started(&mut self) {
        self.ping_since = None;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn our_key(&self) -> &BoxPublicKey {
        &self.our_key
    }
}
