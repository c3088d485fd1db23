/*
    SwitchTable - spanning tree state and greedy forwarding

    Pure state machine, no I/O. The switch actor owns exactly one of these
    and feeds it announcements, link events and clock ticks; the returned
    `SwitchUpdate` tells the actor whether to re-announce and whether our
    coordinates moved.

    Root election:
      Every node starts as its own root. An announcement naming a better root
      (higher TreeID) is adopted immediately; for the same root we prefer the
      cheaper path and otherwise follow our parent's timestamp refreshes.
      A root that stops refreshing is dropped after `timeout`, and its last
      timestamp is remembered so replayed announcements can't revive it.

    Forwarding:
      A packet goes to the peer closest (in tree distance) to its destination,
      among peers strictly closer than we are, weighted by link bandwidth.
      If nobody is closer the packet is ours.
*/

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::locator::{first_is_better, Locator};
use crate::crypto::{BoxPublicKey, SigPublicKey};
use crate::wire::{SwitchMsg, SwitchPort};

/// Added to a peer's observed delay so that path length still matters when
/// every peer delivers announcements at the same moment.
const BASE_DELAY_MS: u128 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct SwitchTimers {
    pub timeout: Duration,
    pub update_interval: Duration,
    pub throttle: Duration,
}

impl Default for SwitchTimers {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            update_interval: Duration::from_secs(30),
            throttle: Duration::from_secs(15),
        }
    }
}

/// What the caller has to do after a state change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwitchUpdate {
    /// Our announcement changed and must be sent to every peer
    pub announce: bool,
    /// Our coordinates (root or path) changed
    pub coords_changed: bool,
}

impl SwitchUpdate {
    pub fn merge(&mut self, other: SwitchUpdate) {
        self.announce |= other.announce;
        self.coords_changed |= other.coords_changed;
    }
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub port: SwitchPort,
    pub sig_key: SigPublicKey,
    pub box_key: BoxPublicKey,
    /// Coordinates we would have with this peer as parent
    pub locator: Option<Locator>,
    pub msg: Option<SwitchMsg>,
    pub first_seen: Instant,
    /// Last announcement received
    pub last_seen: Instant,
    /// How long after the first sighting this peer delivered the current
    /// root timestamp
    pub delay: Duration,
    /// Observed link throughput in bytes per second
    pub bandwidth: f64,
    /// Table sequence number when this entry last changed
    pub seq: u64,
}

impl PeerEntry {
    /// The peer's own coordinates (our would-be coordinates minus the last hop).
    pub fn coords(&self) -> Option<&[SwitchPort]> {
        self.locator
            .as_ref()
            .map(|loc| &loc.coords[..loc.coords.len().saturating_sub(1)])
    }

    fn path_cost(&self) -> u128 {
        let len = self.locator.as_ref().map_or(0, |loc| loc.coords.len()) as u128;
        len * (self.delay.as_millis() + BASE_DELAY_MS)
    }
}

#[derive(Debug, Clone)]
struct TableElem {
    port: SwitchPort,
    coords: Vec<SwitchPort>,
    tstamp: i64,
    bandwidth: f64,
}

pub struct SwitchTable {
    key: SigPublicKey,
    timers: SwitchTimers,
    locator: Locator,
    parent: SwitchPort,
    /// When our root timestamp last changed
    time: Instant,
    peers: HashMap<SwitchPort, PeerEntry>,
    dropped: HashMap<SigPublicKey, i64>,
    /// First sighting of the newest timestamp of the current root
    newest: Option<(SigPublicKey, i64, Instant)>,
    lookup: Option<Vec<TableElem>>,
    seq: u64,
}

impl SwitchTable {
    pub fn new(key: SigPublicKey, timers: SwitchTimers, now: Instant, unix_now: i64) -> Self {
        Self {
            key,
            timers,
            locator: Locator::new_root(key, unix_now),
            parent: 0,
            time: now,
            peers: HashMap::new(),
            dropped: HashMap::new(),
            newest: None,
            lookup: None,
            seq: 0,
        }
    }

    pub fn key(&self) -> &SigPublicKey {
        &self.key
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn parent(&self) -> SwitchPort {
        self.parent
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_root(&self) -> bool {
        self.locator.root == self.key
    }

    pub fn peer(&self, port: SwitchPort) -> Option<&PeerEntry> {
        self.peers.get(&port)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Port already assigned to a link with these keys, if any.
    pub fn find_peer(&self, sig_key: &SigPublicKey, box_key: &BoxPublicKey) -> Option<SwitchPort> {
        self.peers
            .values()
            .find(|p| p.sig_key == *sig_key && p.box_key == *box_key)
            .map(|p| p.port)
    }

    /// Register a new link on the lowest free port above 0.
    pub fn add_peer(&mut self, sig_key: SigPublicKey, box_key: BoxPublicKey, now: Instant) -> SwitchPort {
        let mut port: SwitchPort = 1;
        while self.peers.contains_key(&port) {
            port += 1;
        }
        self.peers.insert(
            port,
            PeerEntry {
                port,
                sig_key,
                box_key,
                locator: None,
                msg: None,
                first_seen: now,
                last_seen: now,
                delay: Duration::ZERO,
                bandwidth: 0.0,
                seq: self.seq,
            },
        );
        port
    }

    pub fn set_bandwidth(&mut self, port: SwitchPort, bytes_per_sec: f64) {
        if let Some(peer) = self.peers.get_mut(&port) {
            peer.bandwidth = bytes_per_sec;
            if let Some(lookup) = self.lookup.as_mut() {
                for elem in lookup.iter_mut().filter(|e| e.port == port) {
                    elem.bandwidth = bytes_per_sec;
                }
            }
        }
    }

    /// Our announcement, before the link appends its signed hop.
    /// None while we have lost our parent but still follow its root.
    pub fn get_msg(&self) -> Option<SwitchMsg> {
        if self.parent == 0 {
            if !self.is_root() {
                return None;
            }
            return Some(SwitchMsg {
                root: self.key,
                tstamp: self.locator.tstamp,
                hops: Vec::new(),
            });
        }
        self.peers.get(&self.parent).and_then(|p| p.msg.clone())
    }

    fn observe_tstamp(&mut self, root: &SigPublicKey, tstamp: i64, now: Instant) -> Duration {
        if *root != self.locator.root && !first_is_better(root, &self.locator.root) {
            return Duration::ZERO;
        }
        match self.newest {
            Some((r, t, at)) if r == *root && t >= tstamp => now.saturating_duration_since(at),
            _ => {
                self.newest = Some((*root, tstamp, now));
                Duration::ZERO
            }
        }
    }

    fn is_loop(&self, msg: &SwitchMsg) -> bool {
        if msg.root == self.key {
            return true;
        }
        let n = msg.hops.len();
        msg.hops[..n.saturating_sub(1)]
            .iter()
            .any(|hop| hop.next == self.key)
    }

    /// Process an announcement received on `port`. The link has already
    /// verified the hop signatures.
    pub fn handle_msg(&mut self, port: SwitchPort, msg: &SwitchMsg, now: Instant) -> SwitchUpdate {
        self.process_msg(port, msg, now, false)
    }

    fn process_msg(
        &mut self,
        port: SwitchPort,
        msg: &SwitchMsg,
        now: Instant,
        reprocessing: bool,
    ) -> SwitchUpdate {
        let mut update = SwitchUpdate::default();
        if !self.peers.contains_key(&port) {
            return update;
        }

        let sender_loc = Locator {
            root: msg.root,
            tstamp: msg.tstamp,
            coords: msg.coords(),
        };
        let delay = if reprocessing {
            self.peers.get(&port).map_or(Duration::ZERO, |p| p.delay)
        } else {
            self.observe_tstamp(&msg.root, msg.tstamp, now)
        };

        let seq = self.seq;
        let mut moved = false;
        if let Some(peer) = self.peers.get_mut(&port) {
            moved = peer
                .locator
                .as_ref()
                .map_or(true, |old| !old.same_position(&sender_loc));
            peer.locator = Some(sender_loc.clone());
            peer.msg = Some(msg.clone());
            peer.delay = delay;
            peer.seq = seq;
            if !reprocessing {
                peer.last_seen = now;
            }
        }
        if moved {
            self.lookup = None;
        }

        let parent = self.peers.get(&self.parent);
        let no_parent = parent.is_none();
        let parent_cost = parent.map_or(u128::MAX, |p| p.path_cost());
        let sender_cost = self.peers.get(&port).map_or(u128::MAX, |p| p.path_cost());
        let drop_tstamp = self.dropped.get(&msg.root).copied();

        let accept = if self.is_loop(msg) {
            false
        } else if drop_tstamp.is_some_and(|t| t >= msg.tstamp) {
            false
        } else if first_is_better(&msg.root, &self.locator.root) {
            true
        } else if msg.root != self.locator.root {
            false
        } else if self.locator.tstamp > msg.tstamp {
            false
        } else if no_parent {
            true
        } else if port != self.parent && sender_cost < parent_cost {
            true
        } else if port != self.parent {
            false
        } else if !reprocessing && !self.locator.same_position(&sender_loc) {
            // our parent moved: pick again, considering it last
            self.parent = 0;
            let others: Vec<(SwitchPort, SwitchMsg)> = self
                .peers
                .values()
                .filter(|p| p.port != port)
                .filter_map(|p| p.msg.clone().map(|m| (p.port, m)))
                .collect();
            for (other_port, other_msg) in others {
                update.merge(self.process_msg(other_port, &other_msg, now, true));
            }
            update.merge(self.process_msg(port, msg, now, true));
            return update;
        } else if now.saturating_duration_since(self.time) < self.timers.throttle {
            false
        } else {
            msg.tstamp > self.locator.tstamp
        };

        if accept {
            update.merge(self.adopt(port, sender_loc, now));
        }
        update
    }

    fn adopt(&mut self, port: SwitchPort, loc: Locator, now: Instant) -> SwitchUpdate {
        let mut update = SwitchUpdate {
            announce: true,
            coords_changed: false,
        };
        if !self.locator.same_position(&loc) {
            update.coords_changed = true;
            self.seq += 1;
            self.lookup = None;
        }
        if self.locator.tstamp != loc.tstamp || self.locator.root != loc.root {
            self.time = now;
        }
        self.locator = loc;
        self.parent = port;
        self.clean_dropped();
        update
    }

    fn clean_dropped(&mut self) {
        let current = self.locator.root;
        self.dropped.retain(|root, _| first_is_better(root, &current));
    }

    /// Periodic root maintenance: time out a silent root, take over when we
    /// outrank it, or refresh our own timestamp when we are the root.
    pub fn clean_root(&mut self, now: Instant, unix_now: i64) -> SwitchUpdate {
        let since = now.saturating_duration_since(self.time);
        let mut reset = false;
        if !self.is_root() {
            if since > self.timers.timeout {
                self.dropped.insert(self.locator.root, self.locator.tstamp);
                reset = true;
            }
            if first_is_better(&self.key, &self.locator.root) {
                reset = true;
            }
        } else if since > self.timers.update_interval {
            reset = true;
        }
        if !reset {
            return SwitchUpdate::default();
        }

        let coords_changed = !self.is_root() || !self.locator.coords.is_empty();
        let tstamp = if self.is_root() {
            unix_now.max(self.locator.tstamp + 1)
        } else {
            unix_now
        };
        self.parent = 0;
        self.time = now;
        self.locator = Locator::new_root(self.key, tstamp);
        if coords_changed {
            self.seq += 1;
            self.lookup = None;
        }
        self.clean_dropped();
        SwitchUpdate {
            announce: true,
            coords_changed,
        }
    }

    /// Remove a peer. Losing the parent makes us pick a new one from the
    /// announcements we already hold.
    pub fn remove_peer(&mut self, port: SwitchPort, now: Instant) -> SwitchUpdate {
        let mut update = SwitchUpdate::default();
        if self.peers.remove(&port).is_none() {
            return update;
        }
        self.lookup = None;
        if port != self.parent {
            return update;
        }
        self.parent = 0;
        let others: Vec<(SwitchPort, SwitchMsg)> = self
            .peers
            .values()
            .filter_map(|p| p.msg.clone().map(|m| (p.port, m)))
            .collect();
        for (other_port, msg) in others {
            update.merge(self.process_msg(other_port, &msg, now, true));
        }
        update
    }

    /// Ports whose last announcement is older than `limit`.
    pub fn silent_peers(&self, now: Instant, limit: Duration) -> Vec<SwitchPort> {
        self.peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > limit)
            .map(|p| p.port)
            .collect()
    }

    fn build_lookup(&self) -> Vec<TableElem> {
        self.peers
            .values()
            .filter_map(|peer| {
                let loc = peer.locator.as_ref()?;
                if loc.root != self.locator.root {
                    return None;
                }
                Some(TableElem {
                    port: peer.port,
                    coords: peer.coords()?.to_vec(),
                    tstamp: loc.tstamp,
                    bandwidth: peer.bandwidth,
                })
            })
            .collect()
    }

    /// Best next hop towards `dest`, or None if the packet is for us (no peer
    /// is strictly closer).
    pub fn next_hop(&mut self, dest: &[SwitchPort]) -> Option<SwitchPort> {
        let my_dist = self.locator.dist(dest);
        if my_dist == 0 {
            return None;
        }
        if self.lookup.is_none() {
            self.lookup = Some(self.build_lookup());
        }
        let lookup = self.lookup.as_ref()?;

        let mut best: Option<(&TableElem, usize, f64)> = None;
        for elem in lookup {
            let d = super::locator::dist(&elem.coords, dest);
            if d >= my_dist {
                continue;
            }
            let score = elem.bandwidth.max(1.0) / (1.0 + d as f64);
            let better = match best {
                None => true,
                Some((b, bd, bs)) => {
                    if score != bs {
                        score > bs
                    } else if d != bd {
                        d < bd
                    } else if elem.tstamp != b.tstamp {
                        elem.tstamp > b.tstamp
                    } else {
                        elem.port < b.port
                    }
                }
            };
            if better {
                best = Some((elem, d, score));
            }
        }
        best.map(|(elem, _, _)| elem.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BoxKeyPair, SigKeyPair, Signature};
    use crate::wire::SwitchMsgHop;

    /// What `from` would send over its port `port` to the node with `to`.
    fn announce(from: &SwitchTable, port: SwitchPort, to: &SigPublicKey) -> SwitchMsg {
        let mut msg = from.get_msg().expect("table has an announcement");
        msg.hops.push(SwitchMsgHop {
            port,
            next: *to,
            sig: Signature::from_bytes([0u8; 64]),
        });
        msg
    }

    /// Sig keys sorted so that keys[0] has the highest TreeID.
    fn ranked_keys(n: usize) -> Vec<SigPublicKey> {
        let mut keys: Vec<SigPublicKey> = (0..n).map(|_| SigKeyPair::generate().public).collect();
        keys.sort_by(|a, b| {
            if first_is_better(a, b) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        keys
    }

    fn table(key: SigPublicKey, now: Instant) -> SwitchTable {
        SwitchTable::new(key, SwitchTimers::default(), now, 1000)
    }

    fn link(a: &mut SwitchTable, b: &mut SwitchTable, now: Instant) -> (SwitchPort, SwitchPort) {
        let box_key = BoxKeyPair::generate().public;
        let pa = a.add_peer(*b.key(), box_key, now);
        let pb = b.add_peer(*a.key(), box_key, now);
        (pa, pb)
    }

    #[test]
    fn test_starts_as_own_root() {
        let now = Instant::now();
        let key = SigKeyPair::generate().public;
        let t = table(key, now);
        assert!(t.is_root());
        assert!(t.locator().coords.is_empty());
        let msg = t.get_msg().unwrap();
        assert_eq!(msg.root, key);
        assert!(msg.hops.is_empty());
    }

    #[test]
    fn test_ports_allocate_lowest_free() {
        let now = Instant::now();
        let mut t = table(SigKeyPair::generate().public, now);
        let k = || BoxKeyPair::generate().public;
        let s = || SigKeyPair::generate().public;
        assert_eq!(t.add_peer(s(), k(), now), 1);
        assert_eq!(t.add_peer(s(), k(), now), 2);
        assert_eq!(t.add_peer(s(), k(), now), 3);
        t.remove_peer(2, now);
        assert_eq!(t.add_peer(s(), k(), now), 2);
    }

    #[test]
    fn test_adopts_better_root() {
        let now = Instant::now();
        let keys = ranked_keys(2);
        let mut strong = table(keys[0], now);
        let mut weak = table(keys[1], now);
        let (ps, pw) = link(&mut strong, &mut weak, now);

        let update = weak.handle_msg(pw, &announce(&strong, ps, &keys[1]), now);
        assert!(update.announce && update.coords_changed);
        assert_eq!(weak.locator().root, keys[0]);
        assert_eq!(weak.locator().coords, vec![ps]);
        assert_eq!(weak.parent(), pw);

        // the weaker announcement does not move the stronger node
        let update = strong.handle_msg(ps, &announce(&weak, pw, &keys[0]), now);
        assert_eq!(update, SwitchUpdate::default());
        assert!(strong.is_root());
    }

    #[test]
    fn test_rejects_loop() {
        let now = Instant::now();
        let keys = ranked_keys(3);
        let mut root = table(keys[0], now);
        let mut mid = table(keys[1], now);
        let mut leaf = table(keys[2], now);
        let (r_m, m_r) = link(&mut root, &mut mid, now);
        let (m_l, l_m) = link(&mut mid, &mut leaf, now);

        mid.handle_msg(m_r, &announce(&root, r_m, &keys[1]), now);
        leaf.handle_msg(l_m, &announce(&mid, m_l, &keys[2]), now);
        assert_eq!(leaf.locator().coords, vec![r_m, m_l]);

        // leaf's announcement back to mid carries mid in its path
        let back = announce(&leaf, l_m, &keys[1]);
        let before = mid.locator().clone();
        let update = mid.handle_msg(m_l, &back, now);
        assert_eq!(update, SwitchUpdate::default());
        assert_eq!(mid.locator(), &before);
        assert_eq!(mid.parent(), m_r);
    }

    #[test]
    fn test_root_timeout_and_dropped_replay() {
        let now = Instant::now();
        let keys = ranked_keys(2);
        let mut strong = table(keys[0], now);
        let mut weak = table(keys[1], now);
        let (ps, pw) = link(&mut strong, &mut weak, now);
        let stale = announce(&strong, ps, &keys[1]);
        weak.handle_msg(pw, &stale, now);

        let later = now + Duration::from_secs(61);
        let update = weak.clean_root(later, 2000);
        assert!(update.coords_changed);
        assert!(weak.is_root());
        assert_eq!(weak.locator().tstamp, 2000);

        // replaying the old announcement does not bring the root back
        let update = weak.handle_msg(pw, &stale, later);
        assert_eq!(update, SwitchUpdate::default());
        assert!(weak.is_root());

        // a fresh timestamp does
        let mut fresh = stale.clone();
        fresh.tstamp += 1;
        weak.handle_msg(pw, &fresh, later);
        assert_eq!(weak.locator().root, keys[0]);
    }

    #[test]
    fn test_root_refreshes_tstamp() {
        let now = Instant::now();
        let mut t = table(SigKeyPair::generate().public, now);
        assert_eq!(t.clean_root(now + Duration::from_secs(5), 1005), SwitchUpdate::default());

        let update = t.clean_root(now + Duration::from_secs(31), 1000);
        assert!(update.announce);
        assert!(!update.coords_changed);
        // strictly increasing even if the wall clock did not move
        assert_eq!(t.locator().tstamp, 1001);
    }

    #[test]
    fn test_throttles_parent_refresh() {
        let now = Instant::now();
        let keys = ranked_keys(2);
        let mut strong = table(keys[0], now);
        let mut weak = table(keys[1], now);
        let (ps, pw) = link(&mut strong, &mut weak, now);
        weak.handle_msg(pw, &announce(&strong, ps, &keys[1]), now);

        let mut refresh = announce(&strong, ps, &keys[1]);
        refresh.tstamp += 1;
        let soon = now + Duration::from_secs(1);
        assert_eq!(weak.handle_msg(pw, &refresh, soon), SwitchUpdate::default());
        assert_eq!(weak.locator().tstamp, 1000);

        let later = now + Duration::from_secs(16);
        let update = weak.handle_msg(pw, &refresh, later);
        assert!(update.announce);
        assert!(!update.coords_changed);
        assert_eq!(weak.locator().tstamp, 1001);
    }

    #[test]
    fn test_prefers_shorter_path() {
        let now = Instant::now();
        let keys = ranked_keys(4);
        let mut root = table(keys[0], now);
        let mut a = table(keys[1], now);
        let mut b = table(keys[2], now);
        let mut c = table(keys[3], now);

        let (r_a, a_r) = link(&mut root, &mut a, now);
        let (a_c, c_a) = link(&mut a, &mut c, now);
        let (r_b, b_r) = link(&mut root, &mut b, now);
        let (_, c_r) = {
            let box_key = BoxKeyPair::generate().public;
            let p = root.add_peer(keys[3], box_key, now);
            (p, c.add_peer(keys[0], box_key, now))
        };
        let r_c = root.peers().find(|p| p.sig_key == keys[3]).unwrap().port;

        a.handle_msg(a_r, &announce(&root, r_a, &keys[1]), now);
        b.handle_msg(b_r, &announce(&root, r_b, &keys[2]), now);

        // c first hears of the root through a (two hops)
        c.handle_msg(c_a, &announce(&a, a_c, &keys[3]), now);
        assert_eq!(c.parent(), c_a);
        assert_eq!(c.locator().coords.len(), 2);

        // then directly from the root at the same moment: one hop is cheaper
        let update = c.handle_msg(c_r, &announce(&root, r_c, &keys[3]), now);
        assert!(update.coords_changed);
        assert_eq!(c.parent(), c_r);
        assert_eq!(c.locator().coords, vec![r_c]);
    }

    #[test]
    fn test_parent_loss_reparents() {
        let now = Instant::now();
        let keys = ranked_keys(3);
        let mut root = table(keys[0], now);
        let mut a = table(keys[1], now);
        let mut b = table(keys[2], now);
        let (r_a, a_r) = link(&mut root, &mut a, now);
        let (r_b, b_r) = link(&mut root, &mut b, now);
        let (a_b, b_a) = link(&mut a, &mut b, now);

        a.handle_msg(a_r, &announce(&root, r_a, &keys[1]), now);
        b.handle_msg(b_r, &announce(&root, r_b, &keys[2]), now);
        b.handle_msg(b_a, &announce(&a, a_b, &keys[2]), now);
        assert_eq!(b.parent(), b_r);

        let update = b.remove_peer(b_r, now);
        assert!(update.coords_changed);
        assert_eq!(b.parent(), b_a);
        assert_eq!(b.locator().coords, vec![r_a, a_b]);
    }

    #[test]
    fn test_next_hop_strictly_closer() {
        let now = Instant::now();
        let keys = ranked_keys(3);
        let mut root = table(keys[0], now);
        let mut a = table(keys[1], now);
        let mut b = table(keys[2], now);
        let (r_a, a_r) = link(&mut root, &mut a, now);
        let (r_b, b_r) = link(&mut root, &mut b, now);

        a.handle_msg(a_r, &announce(&root, r_a, &keys[1]), now);
        b.handle_msg(b_r, &announce(&root, r_b, &keys[2]), now);
        root.handle_msg(r_a, &announce(&a, a_r, &keys[0]), now);
        root.handle_msg(r_b, &announce(&b, b_r, &keys[0]), now);

        // at the root: child coordinates route to that child
        assert_eq!(root.next_hop(&[r_a]), Some(r_a));
        assert_eq!(root.next_hop(&[r_b, 9]), Some(r_b));
        assert_eq!(root.next_hop(&[]), None);
        // unknown subtree: nobody closer
        assert_eq!(root.next_hop(&[77]), None);

        // at a: everything outside its subtree goes up
        assert_eq!(a.next_hop(&[r_b]), Some(a_r));
        assert_eq!(a.next_hop(&[r_a]), None);
    }

    #[test]
    fn test_next_hop_prefers_bandwidth() {
        let now = Instant::now();
        let keys = ranked_keys(3);
        let mut root = table(keys[0], now);
        let mut a = table(keys[1], now);
        let mut b = table(keys[2], now);
        let (r_a, a_r) = link(&mut root, &mut a, now);
        let (r_b, b_r) = link(&mut root, &mut b, now);
        let (a_b, b_a) = link(&mut a, &mut b, now);
        a.handle_msg(a_r, &announce(&root, r_a, &keys[1]), now);
        b.handle_msg(b_r, &announce(&root, r_b, &keys[2]), now);
        a.handle_msg(a_b, &announce(&b, b_a, &keys[1]), now);

        // from a, both the root (dist 1) and b (dist 0) are closer to b
        assert_eq!(a.next_hop(&[r_b]), Some(a_b));
        a.set_bandwidth(a_r, 1_000_000.0);
        a.set_bandwidth(a_b, 10.0);
        assert_eq!(a.next_hop(&[r_b]), Some(a_r));
    }

    #[test]
    fn test_silent_peers() {
        let now = Instant::now();
        let mut t = table(SigKeyPair::generate().public, now);
        let port = t.add_peer(SigKeyPair::generate().public, BoxKeyPair::generate().public, now);
        assert!(t.silent_peers(now, Duration::from_secs(10)).is_empty());
        assert_eq!(t.silent_peers(now + Duration::from_secs(11), Duration::from_secs(10)), vec![port]);
    }
}
