/*
    DhtTable - the ring neighbourhood of this node

    Pure state; the DHT actor owns it and performs all I/O.

    Responsibilities:
    - keep the `max_entries` nodes nearest to us on the ring (both sides)
    - answer lookups: candidates between us and a target, closest first,
      plus our successor so a requester always has somewhere to go
    - track outstanding requests so unsolicited responses are ignored
    - decide whom to ping: successor and predecessor for stabilization,
      newly learned candidates that beat them, with a per-entry back-off
    - evict entries that stay silent or miss too many pings
*/

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::ring::{closer_to, dht_ordered, ring_gap};
use crate::crypto::{BoxPublicKey, NodeId};
use crate::wire::{DhtResponse, DhtResponseInfo, SwitchPort};

/// Back-off added per ping sent to the same entry.
const PING_THROTTLE_STEP: Duration = Duration::from_secs(1);

/// Outstanding requests older than this are forgotten.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct DhtSettings {
    pub lookup_size: usize,
    pub max_entries: usize,
    pub max_pings: u32,
    pub silence_timeout: Duration,
    pub max_ping_throttle: Duration,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            lookup_size: 16,
            max_entries: 64,
            max_pings: 3,
            silence_timeout: Duration::from_secs(60),
            max_ping_throttle: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DhtInfo {
    pub key: BoxPublicKey,
    pub node_id: NodeId,
    pub coords: Vec<SwitchPort>,
    /// Last time we heard from this node
    pub recv: Instant,
    pub last_ping: Option<Instant>,
    /// Pings sent since the last reply
    pub pings: u32,
    pub throttle: Duration,
}

impl DhtInfo {
    pub fn new(key: BoxPublicKey, coords: Vec<SwitchPort>, now: Instant) -> Self {
        Self {
            key,
            node_id: NodeId::for_key(&key),
            coords,
            recv: now,
            last_ping: None,
            pings: 0,
            throttle: Duration::ZERO,
        }
    }

    fn ping_due(&self, now: Instant) -> bool {
        self.last_ping
            .map_or(true, |at| now.saturating_duration_since(at) >= self.throttle)
    }

    pub fn as_response_info(&self) -> DhtResponseInfo {
        DhtResponseInfo {
            key: self.key,
            coords: self.coords.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    sent: Instant,
    for_search: bool,
}

/// A request the actor should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    pub key: BoxPublicKey,
    pub coords: Vec<SwitchPort>,
    pub target: NodeId,
}

/// What to do with a response after the table has absorbed it.
#[derive(Debug, Default)]
pub struct ResponseOutcome {
    /// The response matched a request we sent
    pub expected: bool,
    /// That request was sent on behalf of a search
    pub for_search: bool,
    pub pings: Vec<PingRequest>,
}

pub struct DhtTable {
    key: BoxPublicKey,
    node_id: NodeId,
    settings: DhtSettings,
    entries: HashMap<NodeId, DhtInfo>,
    requests: HashMap<(BoxPublicKey, NodeId), PendingRequest>,
}

impl DhtTable {
    pub fn new(key: BoxPublicKey, settings: DhtSettings) -> Self {
        Self {
            key,
            node_id: NodeId::for_key(&key),
            settings,
            entries: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&DhtInfo> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DhtInfo> {
        self.entries.values()
    }

    /// The nearest node clockwise after us.
    pub fn successor(&self) -> Option<&DhtInfo> {
        self.entries
            .values()
            .min_by_key(|info| super::ring::clockwise(&self.node_id, &info.node_id))
    }

    /// The nearest node clockwise before us.
    pub fn predecessor(&self) -> Option<&DhtInfo> {
        self.entries
            .values()
            .min_by_key(|info| super::ring::clockwise(&info.node_id, &self.node_id))
    }

    /// Whether `id` would improve on our successor or predecessor.
    fn beats_neighbours(&self, id: &NodeId) -> bool {
        let succ = self
            .successor()
            .map_or(true, |s| dht_ordered(&self.node_id, id, &s.node_id));
        let pred = self
            .predecessor()
            .map_or(true, |p| dht_ordered(&p.node_id, id, &self.node_id));
        succ || pred
    }

    /// Worth keeping: the table has room, or it is nearer than our farthest entry.
    pub fn is_important(&self, id: &NodeId) -> bool {
        if *id == self.node_id {
            return false;
        }
        if self.entries.len() < self.settings.max_entries {
            return true;
        }
        let gap = ring_gap(&self.node_id, id);
        self.entries
            .values()
            .any(|info| ring_gap(&self.node_id, &info.node_id) > gap)
    }

    /// Add or refresh an entry. Refreshing resets the missed-ping counter
    /// but keeps the ping back-off.
    pub fn insert(&mut self, key: BoxPublicKey, coords: Vec<SwitchPort>, now: Instant) {
        if key == self.key {
            return;
        }
        let id = NodeId::for_key(&key);
        match self.entries.get_mut(&id) {
            Some(info) => {
                info.coords = coords;
                info.recv = now;
                info.pings = 0;
            }
            None => {
                self.entries.insert(id, DhtInfo::new(key, coords, now));
                self.trim();
            }
        }
    }

    fn trim(&mut self) {
        while self.entries.len() > self.settings.max_entries {
            let center = self.node_id;
            let farthest = self
                .entries
                .keys()
                .max_by_key(|id| ring_gap(&center, id))
                .copied();
            match farthest {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<DhtInfo> {
        self.entries.remove(id)
    }

    /// Candidates for `target`, closest first. Unless `everything`, only
    /// nodes strictly between us and the target are considered, and our
    /// successor is appended so the caller can always make progress.
    pub fn lookup(&self, target: &NodeId, everything: bool) -> Vec<DhtInfo> {
        let mut results: Vec<&DhtInfo> = self
            .entries
            .values()
            .filter(|info| everything || dht_ordered(&self.node_id, &info.node_id, target))
            .collect();
        results.sort_by(|a, b| closer_to(target, &a.node_id, &b.node_id));

        let mut out: Vec<DhtInfo> = if everything {
            results.into_iter().take(self.settings.lookup_size).cloned().collect()
        } else {
            results
                .into_iter()
                .take(self.settings.lookup_size.saturating_sub(1))
                .cloned()
                .collect()
        };
        if !everything {
            if let Some(succ) = self.successor() {
                if !out.iter().any(|info| info.node_id == succ.node_id) {
                    out.push(succ.clone());
                }
            }
        }
        out
    }

    /// Handle a request from `from`. Returns the candidates to answer with.
    pub fn handle_request(
        &mut self,
        from: BoxPublicKey,
        coords: Vec<SwitchPort>,
        target: &NodeId,
        now: Instant,
    ) -> Vec<DhtResponseInfo> {
        let infos = self
            .lookup(target, false)
            .into_iter()
            .filter(|info| info.key != from)
            .map(|info| info.as_response_info())
            .collect();
        let id = NodeId::for_key(&from);
        if self.entries.contains_key(&id) || self.is_important(&id) {
            self.insert(from, coords, now);
        }
        infos
    }

    /// Remember that we asked `key` about `target`.
    pub fn request_sent(&mut self, key: BoxPublicKey, target: NodeId, for_search: bool, now: Instant) {
        let pending = self.requests.entry((key, target)).or_insert(PendingRequest {
            sent: now,
            for_search,
        });
        pending.sent = now;
        pending.for_search |= for_search;

        if let Some(info) = self.entries.get_mut(&NodeId::for_key(&key)) {
            info.pings += 1;
            info.last_ping = Some(now);
            info.throttle = (info.throttle + PING_THROTTLE_STEP).min(self.settings.max_ping_throttle);
        }
    }

    /// Absorb a response from `from`. Responses nobody asked for are ignored.
    pub fn handle_response(
        &mut self,
        from: BoxPublicKey,
        res: &DhtResponse,
        now: Instant,
    ) -> ResponseOutcome {
        let Some(pending) = self.requests.remove(&(from, res.dest)) else {
            return ResponseOutcome::default();
        };
        self.insert(from, res.coords.clone(), now);

        let mut pings = Vec::new();
        for info in &res.infos {
            if info.key == self.key {
                continue;
            }
            let id = NodeId::for_key(&info.key);
            if self.entries.contains_key(&id) || !self.beats_neighbours(&id) {
                continue;
            }
            self.insert(info.key, info.coords.clone(), now);
            pings.push(PingRequest {
                key: info.key,
                coords: info.coords.clone(),
                target: self.node_id,
            });
        }

        ResponseOutcome {
            expected: true,
            for_search: pending.for_search,
            pings,
        }
    }

    /// Periodic upkeep: evict dead entries, then ping successor and
    /// predecessor if their back-off allows.
    pub fn maintain(&mut self, now: Instant) -> Vec<PingRequest> {
        let silence = self.settings.silence_timeout;
        let max_pings = self.settings.max_pings;
        self.entries.retain(|_, info| {
            now.saturating_duration_since(info.recv) <= silence
                && !(info.pings >= max_pings && info.ping_due(now))
        });
        self.requests
            .retain(|_, req| now.saturating_duration_since(req.sent) < REQUEST_TIMEOUT);

        let mut pings = Vec::new();
        if let Some(succ) = self.successor() {
            if succ.ping_due(now) {
                pings.push(PingRequest {
                    key: succ.key,
                    coords: succ.coords.clone(),
                    target: succ.node_id.prev(),
                });
            }
        }
        if let Some(pred) = self.predecessor() {
            let duplicate = pings.iter().any(|p| p.key == pred.key);
            if pred.ping_due(now) && !duplicate {
                pings.push(PingRequest {
                    key: pred.key,
                    coords: pred.coords.clone(),
                    target: self.node_id,
                });
            }
        }
        pings
    }

    /// Ping a directly connected peer if its back-off allows.
    pub fn peer_ping(&self, key: &BoxPublicKey, now: Instant) -> Option<PingRequest> {
        let info = self.entries.get(&NodeId::for_key(key))?;
        info.ping_due(now).then(|| PingRequest {
            key: info.key,
            coords: info.coords.clone(),
            target: self.node_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BoxKeyPair;

    fn keys(n: usize) -> Vec<BoxPublicKey> {
        (0..n).map(|_| BoxKeyPair::generate().public).collect()
    }

    fn small(max_entries: usize) -> DhtSettings {
        DhtSettings {
            lookup_size: 4,
            max_entries,
            ..DhtSettings::default()
        }
    }

    #[test]
    fn test_successor_and_predecessor() {
        let now = Instant::now();
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        assert!(table.successor().is_none());

        let others = keys(8);
        for k in &others {
            table.insert(*k, vec![1], now);
        }
        let me_id = NodeId::for_key(&me);
        let succ = table.successor().unwrap().node_id;
        let pred = table.predecessor().unwrap().node_id;
        for info in table.entries() {
            if info.node_id != succ {
                assert!(!dht_ordered(&me_id, &info.node_id, &succ));
            }
            if info.node_id != pred {
                assert!(!dht_ordered(&pred, &info.node_id, &me_id));
            }
        }
    }

    #[test]
    fn test_ignores_self() {
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        table.insert(me, vec![], Instant::now());
        assert!(table.is_empty());
    }

    #[test]
    fn test_trim_keeps_nearest() {
        let now = Instant::now();
        let me = BoxKeyPair::generate().public;
        let me_id = NodeId::for_key(&me);
        let mut table = DhtTable::new(me, small(4));
        let all = keys(12);
        for k in &all {
            table.insert(*k, vec![], now);
        }
        assert_eq!(table.len(), 4);

        let worst_kept = table
            .entries()
            .map(|i| ring_gap(&me_id, &i.node_id))
            .max()
            .unwrap();
        for k in &all {
            let id = NodeId::for_key(k);
            if table.get(&id).is_none() {
                assert!(ring_gap(&me_id, &id) >= worst_kept);
            }
        }
    }

    #[test]
    fn test_lookup_between_and_successor() {
        let now = Instant::now();
        let me = BoxKeyPair::generate().public;
        let me_id = NodeId::for_key(&me);
        let mut table = DhtTable::new(me, small(64));
        for k in keys(20) {
            table.insert(k, vec![], now);
        }
        let target = NodeId::for_key(&BoxKeyPair::generate().public);
        let found = table.lookup(&target, false);
        let succ = table.successor().unwrap().node_id;

        assert!(found.len() <= 4);
        assert!(found.iter().any(|i| i.node_id == succ));
        for info in found.iter().filter(|i| i.node_id != succ) {
            assert!(dht_ordered(&me_id, &info.node_id, &target));
        }
        // sorted closest first (excluding the appended successor)
        let between: Vec<_> = found.iter().filter(|i| i.node_id != succ).collect();
        for pair in between.windows(2) {
            assert_ne!(
                closer_to(&target, &pair[0].node_id, &pair[1].node_id),
                std::cmp::Ordering::Greater
            );
        }
    }

    #[test]
    fn test_unsolicited_response_ignored() {
        let now = Instant::now();
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        let from = BoxKeyPair::generate().public;
        let res = DhtResponse {
            coords: vec![1, 2],
            dest: NodeId::for_key(&me),
            infos: vec![],
        };
        let outcome = table.handle_response(from, &res, now);
        assert!(!outcome.expected);
        assert!(table.is_empty());

        table.request_sent(from, res.dest, true, now);
        let outcome = table.handle_response(from, &res, now);
        assert!(outcome.expected && outcome.for_search);
        assert_eq!(table.get(&NodeId::for_key(&from)).unwrap().coords, vec![1, 2]);

        // only once
        assert!(!table.handle_response(from, &res, now).expected);
    }

    #[test]
    fn test_response_candidates_pinged() {
        let now = Instant::now();
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        let from = BoxKeyPair::generate().public;
        let candidate = BoxKeyPair::generate().public;
        let target = NodeId::for_key(&me);
        table.request_sent(from, target, false, now);

        let res = DhtResponse {
            coords: vec![1],
            dest: target,
            infos: vec![
                DhtResponseInfo { key: candidate, coords: vec![2] },
                DhtResponseInfo { key: me, coords: vec![] },
            ],
        };
        let outcome = table.handle_response(from, &res, now);
        // with one entry, any other node beats either the successor or the predecessor
        assert_eq!(outcome.pings.len(), 1);
        assert_eq!(outcome.pings[0].key, candidate);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_eviction_after_missed_pings() {
        let start = Instant::now();
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        let peer = BoxKeyPair::generate().public;
        let id = NodeId::for_key(&peer);
        table.insert(peer, vec![1], start);

        let mut now = start;
        for _ in 0..3 {
            let pings = table.maintain(now);
            assert!(pings.iter().any(|p| p.key == peer));
            for p in pings {
                table.request_sent(p.key, p.target, false, now);
            }
            now += Duration::from_secs(5);
        }
        assert_eq!(table.get(&id).unwrap().pings, 3);
        table.maintain(now);
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn test_eviction_after_silence() {
        let start = Instant::now();
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        let peer = BoxKeyPair::generate().public;
        table.insert(peer, vec![1], start);
        table.maintain(start + Duration::from_secs(61));
        assert!(table.is_empty());
    }

    #[test]
    fn test_ping_throttle_grows() {
        let now = Instant::now();
        let me = BoxKeyPair::generate().public;
        let mut table = DhtTable::new(me, DhtSettings::default());
        let peer = BoxKeyPair::generate().public;
        table.insert(peer, vec![1], now);

        assert!(table.peer_ping(&peer, now).is_some());
        table.request_sent(peer, NodeId::for_key(&me), false, now);
        assert!(table.peer_ping(&peer, now).is_none());
        assert!(table.peer_ping(&peer, now + Duration::from_secs(1)).is_some());

        table.request_sent(peer, NodeId::for_key(&me), false, now);
        assert!(table.peer_ping(&peer, now + Duration::from_secs(1)).is_none());
        assert!(table.peer_ping(&peer, now + Duration::from_secs(2)).is_some());
    }
}
