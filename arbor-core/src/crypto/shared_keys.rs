//! Cache of permanent-key shared secrets.
//!
//! Protocol traffic (pings, DHT requests) is sealed with the shared key of
//! the two nodes' permanent box keys. Deriving it costs an X25519 operation,
//! so recently used keys are kept in a bounded LRU.

use hashlink::LruCache;
use std::sync::{Arc, Mutex};

use super::keys::{BoxPublicKey, BoxSecretKey};
use super::sealed_box::SharedKey;

pub const DEFAULT_SHARED_KEY_CACHE_SIZE: usize = 1024;

pub struct SharedKeyCache {
    secret: BoxSecretKey,
    keys: Mutex<LruCache<BoxPublicKey, Arc<SharedKey>>>,
}

impl SharedKeyCache {
    pub fn new(secret: BoxSecretKey, capacity: usize) -> Self {
        Self {
            secret,
            keys: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Shared key with `theirs`, derived on first use.
    pub fn get(&self, theirs: &BoxPublicKey) -> Arc<SharedKey> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = keys.get(theirs) {
            return key.clone();
        }
        let key = Arc::new(SharedKey::derive(&self.secret, theirs));
        keys.insert(*theirs, key.clone());
        key
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::BoxKeyPair;

    #[test]
    fn test_cache_returns_same_key() {
        let me = BoxKeyPair::generate();
        let them = BoxKeyPair::generate();
        let cache = SharedKeyCache::new(me.secret.clone(), 4);

        let first = cache.get(&them.public);
        let second = cache.get(&them.public);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_is_bounded() {
        let me = BoxKeyPair::generate();
        let cache = SharedKeyCache::new(me.secret.clone(), 2);
        for _ in 0..5 {
            cache.get(&BoxKeyPair::generate().public);
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cached_key_matches_peer_derivation() {
        let me = BoxKeyPair::generate();
        let them = BoxKeyPair::generate();
        let cache = SharedKeyCache::new(me.secret.clone(), 4);
        let ours = cache.get(&them.public);
        let theirs = SharedKey::derive(&them.secret, &me.public);

        let (sealed, nonce) = ours.seal_fresh(b"ping").unwrap();
        assert_eq!(theirs.open(&sealed, &nonce).unwrap(), b"ping");
    }
}
