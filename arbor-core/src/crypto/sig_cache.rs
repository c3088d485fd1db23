//! Signature verification cache
//!
//! Switch announcements are re-sent every few seconds with mostly unchanged
//! hop signatures. Verified (signature, message) pairs are remembered for a
//! short while so repeated announcements skip the ed25519 verify.

use hashlink::LruCache;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::keys::{SigPublicKey, Signature};

pub const DEFAULT_SIG_CACHE_SIZE: usize = 4096;
pub const DEFAULT_SIG_CACHE_TTL: Duration = Duration::from_secs(60);

struct KnownSig {
    key: SigPublicKey,
    msg: Vec<u8>,
    verified_at: Instant,
}

pub struct SigCache {
    entries: Mutex<LruCache<Signature, KnownSig>>,
    ttl: Duration,
}

impl SigCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity.max(1))),
            ttl,
        }
    }

    /// Returns true if `sig` is a valid signature by `key` over `msg`.
    pub fn check(&self, key: &SigPublicKey, sig: &Signature, msg: &[u8]) -> bool {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(known) = entries.get(sig) {
                if known.key == *key
                    && known.msg == msg
                    && now.duration_since(known.verified_at) < self.ttl
                {
                    return true;
                }
            }
        }

        if key.verify(msg, sig).is_err() {
            return false;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            *sig,
            KnownSig {
                key: *key,
                msg: msg.to_vec(),
                verified_at: now,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries older than the ttl.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<Signature> = entries
            .iter()
            .filter(|(_, known)| now.duration_since(known.verified_at) >= self.ttl)
            .map(|(sig, _)| *sig)
            .collect();
        for sig in stale {
            entries.remove(&sig);
        }
    }
}

impl Default for SigCache {
    fn default() -> Self {
        Self::new(DEFAULT_SIG_CACHE_SIZE, DEFAULT_SIG_CACHE_TTL)
    }
}
