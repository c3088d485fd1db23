//! State of one outstanding search.
//!
//! Candidates are kept closest-first, where "close" means closely preceding
//! the destination on the ring. A response from node `F` only contributes
//! candidates that lie strictly between `F` and the destination, so every
//! step makes progress and the search cannot circle.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::core_dht::{closer_to, dht_ordered};
use crate::crypto::{BoxPublicKey, NodeId};
use crate::wire::{DhtResponse, DhtResponseInfo, SwitchPort};

/// A search that found its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub key: BoxPublicKey,
    pub coords: Vec<SwitchPort>,
}

#[derive(Debug)]
pub struct SearchState {
    dest: NodeId,
    mask: NodeId,
    width: usize,
    to_visit: Vec<DhtResponseInfo>,
    visited: HashSet<BoxPublicKey>,
    started: Instant,
    last_step: Option<Instant>,
}

impl SearchState {
    /// `seeds` come from our own DHT table.
    pub fn new(
        dest: NodeId,
        mask: NodeId,
        width: usize,
        our_key: BoxPublicKey,
        seeds: Vec<DhtResponseInfo>,
        now: Instant,
    ) -> Self {
        let mut visited = HashSet::new();
        visited.insert(our_key);
        let mut state = Self {
            dest,
            mask,
            width,
            to_visit: Vec::new(),
            visited,
            started: now,
            last_step: None,
        };
        state.push_candidates(seeds.into_iter());
        state
    }

    pub fn dest(&self) -> &NodeId {
        &self.dest
    }

    pub fn mask(&self) -> &NodeId {
        &self.mask
    }

    pub fn pending(&self) -> usize {
        self.to_visit.len()
    }

    pub fn is_match(&self, key: &BoxPublicKey) -> bool {
        NodeId::for_key(key).masked_eq(&self.dest, &self.mask)
    }

    /// A seed that already is the destination, if any.
    pub fn seeded_match(&self) -> Option<SearchResult> {
        self.to_visit
            .iter()
            .find(|info| self.is_match(&info.key))
            .map(|info| SearchResult {
                key: info.key,
                coords: info.coords.clone(),
            })
    }

    /// Absorb a response. Returns the result if the responder or one of its
    /// candidates is the node we are looking for.
    pub fn handle_response(&mut self, from: &BoxPublicKey, res: &DhtResponse) -> Option<SearchResult> {
        if self.is_match(from) {
            return Some(SearchResult {
                key: *from,
                coords: res.coords.clone(),
            });
        }
        if let Some(found) = res.infos.iter().find(|info| self.is_match(&info.key)) {
            return Some(SearchResult {
                key: found.key,
                coords: found.coords.clone(),
            });
        }

        let from_id = NodeId::for_key(from);
        let dest = self.dest;
        let progress = res
            .infos
            .iter()
            .filter(|info| dht_ordered(&from_id, &NodeId::for_key(&info.key), &dest))
            .cloned()
            .collect::<Vec<_>>();
        self.push_candidates(progress.into_iter());
        None
    }

    fn push_candidates(&mut self, infos: impl Iterator<Item = DhtResponseInfo>) {
        for info in infos {
            if self.visited.contains(&info.key) || self.to_visit.iter().any(|i| i.key == info.key) {
                continue;
            }
            self.to_visit.push(info);
        }
        let dest = self.dest;
        self.to_visit.sort_by(|a, b| {
            closer_to(&dest, &NodeId::for_key(&a.key), &NodeId::for_key(&b.key))
        });
        self.to_visit.truncate(self.width);
    }

    /// Next node to ask, closest first. `None` means the search is stuck.
    pub fn next_step(&mut self, now: Instant) -> Option<DhtResponseInfo> {
        if self.to_visit.is_empty() {
            return None;
        }
        let next = self.to_visit.remove(0);
        self.visited.insert(next.key);
        self.last_step = Some(now);
        Some(next)
    }

    pub fn step_due(&self, now: Instant, retry: Duration) -> bool {
        match self.last_step {
            Some(at) => now.saturating_duration_since(at) >= retry,
            None => true,
        }
    }

    pub fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BoxKeyPair;

    fn ranked_keys(n: usize) -> Vec<(BoxPublicKey, NodeId)> {
        let mut keys: Vec<_> = (0..n)
            .map(|_| {
                let key = BoxKeyPair::generate().public;
                (key, NodeId::for_key(&key))
            })
            .collect();
        keys.sort_by_key(|(_, id)| *id);
        keys
    }

    fn info(key: BoxPublicKey, port: u64) -> DhtResponseInfo {
        DhtResponseInfo {
            key,
            coords: vec![port],
        }
    }

    fn response(dest: NodeId, infos: Vec<DhtResponseInfo>) -> DhtResponse {
        DhtResponse {
            coords: vec![9],
            dest,
            infos,
        }
    }

    #[test]
    fn test_seeds_sorted_closest_first() {
        let keys = ranked_keys(5);
        let me = keys[0].0;
        let dest = keys[4].1;
        let now = Instant::now();
        let mut state = SearchState::new(
            dest,
            NodeId::full_mask(),
            16,
            me,
            vec![info(keys[1].0, 1), info(keys[3].0, 3), info(keys[2].0, 2)],
            now,
        );
        assert_eq!(state.pending(), 3);
        assert_eq!(state.next_step(now).unwrap().key, keys[3].0);
        assert_eq!(state.next_step(now).unwrap().key, keys[2].0);
        assert_eq!(state.next_step(now).unwrap().key, keys[1].0);
        assert!(state.next_step(now).is_none());
    }

    #[test]
    fn test_only_progress_is_queued() {
        let keys = ranked_keys(5);
        let me = keys[0].0;
        let dest = keys[4].1;
        let now = Instant::now();
        let mut state = SearchState::new(dest, NodeId::full_mask(), 16, me, vec![], now);

        // keys[2] answers with one node behind it and one ahead of it
        let res = response(dest, vec![info(keys[1].0, 1), info(keys[3].0, 3)]);
        assert!(state.handle_response(&keys[2].0, &res).is_none());
        assert_eq!(state.pending(), 1);
        assert_eq!(state.next_step(now).unwrap().key, keys[3].0);
    }

    #[test]
    fn test_match_in_response() {
        let keys = ranked_keys(3);
        let now = Instant::now();
        let mut state =
            SearchState::new(keys[2].1, NodeId::full_mask(), 16, keys[0].0, vec![], now);
        let res = response(keys[2].1, vec![info(keys[2].0, 7)]);
        let found = state.handle_response(&keys[1].0, &res).unwrap();
        assert_eq!(found.key, keys[2].0);
        assert_eq!(found.coords, vec![7]);
    }

    #[test]
    fn test_responder_is_match() {
        let keys = ranked_keys(2);
        let now = Instant::now();
        let mut state =
            SearchState::new(keys[1].1, NodeId::full_mask(), 16, keys[0].0, vec![], now);
        let res = response(keys[1].1, vec![]);
        let found = state.handle_response(&keys[1].0, &res).unwrap();
        assert_eq!(found.coords, vec![9]);
    }

    #[test]
    fn test_masked_match() {
        let keys = ranked_keys(2);
        let target = keys[1].1;
        // only the first byte is known
        let mut mask = [0u8; 64];
        mask[0] = 0xff;
        let mut partial = [0u8; 64];
        partial[0] = target.as_bytes()[0];
        let state = SearchState::new(
            NodeId::from_bytes(partial),
            NodeId::from_bytes(mask),
            16,
            keys[0].0,
            vec![info(keys[1].0, 4)],
            Instant::now(),
        );
        assert_eq!(state.seeded_match().unwrap().key, keys[1].0);
    }

    #[test]
    fn test_visited_not_requeued_and_width_capped() {
        let keys = ranked_keys(6);
        let me = keys[0].0;
        let dest = keys[5].1;
        let now = Instant::now();
        let seeds = (1..5).map(|i| info(keys[i].0, i as u64)).collect();
        let mut state = SearchState::new(dest, NodeId::full_mask(), 2, me, seeds, now);
        assert_eq!(state.pending(), 2);

        let first = state.next_step(now).unwrap();
        assert_eq!(first.key, keys[4].0);
        let res = response(dest, vec![info(keys[4].0, 4)]);
        state.handle_response(&keys[1].0, &res);
        assert_eq!(state.pending(), 1);
    }

    #[test]
    fn test_timers() {
        let keys = ranked_keys(2);
        let now = Instant::now();
        let mut state = SearchState::new(
            keys[1].1,
            NodeId::full_mask(),
            16,
            keys[0].0,
            vec![info(keys[1].0, 1)],
            now,
        );
        assert!(state.step_due(now, Duration::from_secs(1)));
        state.next_step(now);
        assert!(!state.step_due(now + Duration::from_millis(500), Duration::from_secs(1)));
        assert!(state.step_due(now + Duration::from_secs(1), Duration::from_secs(1)));
        assert!(!state.expired(now + Duration::from_secs(9), Duration::from_secs(10)));
        assert!(state.expired(now + Duration::from_secs(10), Duration::from_secs(10)));
    }
}
