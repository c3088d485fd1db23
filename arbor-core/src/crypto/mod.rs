//! Cryptographic primitives: node keys, sealed boxes, nonces and caches.

mod error;
mod keys;
mod sealed_box;
mod shared_keys;
mod sig_cache;

pub use error::CryptoError;
pub use keys::{
    BoxKeyPair, BoxPublicKey, BoxSecretKey, Handle, NodeId, NodeKeys, SigKeyPair, SigPublicKey,
    SigSecretKey, Signature, TreeId, BOX_PUBLIC_KEY_LEN, HANDLE_LEN, NODE_ID_LEN,
    SIGNATURE_LEN, SIG_PUBLIC_KEY_LEN,
};
pub use sealed_box::{BoxNonce, SharedKey, BOX_NONCE_LEN, BOX_OVERHEAD};
pub use shared_keys::{SharedKeyCache, DEFAULT_SHARED_KEY_CACHE_SIZE};
pub use sig_cache::{SigCache, DEFAULT_SIG_CACHE_SIZE, DEFAULT_SIG_CACHE_TTL};
