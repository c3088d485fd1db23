//! Node key material
//!
//! Every node owns two long-lived keypairs:
//!  - an X25519 "box" keypair, used for key agreement on protocol traffic
//!    and from which the NodeID (and so the address) is derived
//!  - an Ed25519 signing keypair, used to sign switch announcements and from
//!    which the TreeID (spanning tree rank) is derived
//!
//! Secret halves are zeroized on drop by the dalek types that hold them.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::error::CryptoError;

pub const BOX_PUBLIC_KEY_LEN: usize = 32;
pub const BOX_SECRET_KEY_LEN: usize = 32;
pub const SIG_PUBLIC_KEY_LEN: usize = 32;
pub const SIG_SECRET_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const NODE_ID_LEN: usize = 64;
pub const TREE_ID_LEN: usize = 64;
pub const HANDLE_LEN: usize = 8;

fn decode_hex<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
    bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: N,
        actual: bytes.len(),
    })
}

fn sha512<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&Sha512::digest(data)[..N]);
    out
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Implements the byte accessors and hex formatting shared by all fixed-size
/// public identifiers.
macro_rules! fixed_bytes {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
                decode_hex::<$len>(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), hex::encode(&self.0[..4]))
            }
        }
    };
}

/// X25519 public key used for key agreement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxPublicKey([u8; BOX_PUBLIC_KEY_LEN]);
fixed_bytes!(BoxPublicKey, BOX_PUBLIC_KEY_LEN);

impl BoxPublicKey {
    pub(crate) fn to_dalek(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

/// X25519 static secret.
#[derive(Clone)]
pub struct BoxSecretKey(StaticSecret);

impl BoxSecretKey {
    pub fn from_bytes(bytes: [u8; BOX_SECRET_KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        decode_hex::<BOX_SECRET_KEY_LEN>(s).map(Self::from_bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> BoxPublicKey {
        BoxPublicKey(X25519PublicKey::from(&self.0).to_bytes())
    }

    pub(crate) fn diffie_hellman(&self, their: &BoxPublicKey) -> [u8; 32] {
        self.0.diffie_hellman(&their.to_dalek()).to_bytes()
    }
}

impl fmt::Debug for BoxSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxSecretKey(<redacted>)")
    }
}

#[derive(Clone, Debug)]
pub struct BoxKeyPair {
    pub public: BoxPublicKey,
    pub secret: BoxSecretKey,
}

impl BoxKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(BoxSecretKey::from_bytes(random_bytes()))
    }

    pub fn from_secret(secret: BoxSecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }
}

/// Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SigPublicKey([u8; SIG_PUBLIC_KEY_LEN]);
fixed_bytes!(SigPublicKey, SIG_PUBLIC_KEY_LEN);

impl SigPublicKey {
    /// Verify `sig` over `msg` with this key.
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
        key.verify(msg, &sig).map_err(|_| CryptoError::BadSignature)
    }
}

/// Ed25519 signing key (32-byte seed form).
#[derive(Clone)]
pub struct SigSecretKey(SigningKey);

impl SigSecretKey {
    pub fn from_bytes(bytes: [u8; SIG_SECRET_KEY_LEN]) -> Self {
        Self(SigningKey::from_bytes(&bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        decode_hex::<SIG_SECRET_KEY_LEN>(s).map(Self::from_bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> SigPublicKey {
        SigPublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg).to_bytes())
    }
}

impl fmt::Debug for SigSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigSecretKey(<redacted>)")
    }
}

#[derive(Clone, Debug)]
pub struct SigKeyPair {
    pub public: SigPublicKey,
    pub secret: SigSecretKey,
}

impl SigKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SigSecretKey::from_bytes(random_bytes()))
    }

    pub fn from_secret(secret: SigSecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_LEN]);
fixed_bytes!(Signature, SIGNATURE_LEN);

/// Both permanent keypairs of a node.
#[derive(Clone, Debug)]
pub struct NodeKeys {
    pub box_keys: BoxKeyPair,
    pub sig_keys: SigKeyPair,
}

impl NodeKeys {
    pub fn generate() -> Self {
        Self {
            box_keys: BoxKeyPair::generate(),
            sig_keys: SigKeyPair::generate(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::for_key(&self.box_keys.public)
    }
}

/// SHA-512 of a box public key. Determines the node's position on the DHT
/// ring and its overlay address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);
fixed_bytes!(NodeId, NODE_ID_LEN);

impl NodeId {
    pub fn for_key(key: &BoxPublicKey) -> Self {
        Self(sha512(key.as_bytes()))
    }

    /// The identifier immediately before this one on the ring.
    pub fn prev(&self) -> Self {
        let mut out = self.0;
        for b in out.iter_mut().rev() {
            let (v, borrow) = b.overflowing_sub(1);
            *b = v;
            if !borrow {
                break;
            }
        }
        Self(out)
    }

    /// Compare only the bits selected by `mask`.
    pub fn masked_eq(&self, other: &NodeId, mask: &NodeId) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .zip(mask.0.iter())
            .all(|((a, b), m)| a & m == b & m)
    }

    /// A mask selecting every bit.
    pub fn full_mask() -> Self {
        Self([0xff; NODE_ID_LEN])
    }
}

/// SHA-512 of a signing public key. Higher TreeID wins root election.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId([u8; TREE_ID_LEN]);
fixed_bytes!(TreeId, TREE_ID_LEN);

impl TreeId {
    pub fn for_key(key: &SigPublicKey) -> Self {
        Self(sha512(key.as_bytes()))
    }
}

/// Random per-session tag carried in traffic packets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle([u8; HANDLE_LEN]);
fixed_bytes!(Handle, HANDLE_LEN);

impl Handle {
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_keypair_roundtrip_hex() {
        let kp = BoxKeyPair::generate();
        let restored = BoxSecretKey::from_hex(&kp.secret.to_hex()).unwrap();
        assert_eq!(restored.public_key(), kp.public);
        assert_eq!(BoxPublicKey::from_hex(&kp.public.to_hex()).unwrap(), kp.public);
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = SigKeyPair::generate();
        let sig = kp.secret.sign(b"announcement");
        assert!(kp.public.verify(b"announcement", &sig).is_ok());
        assert_eq!(kp.public.verify(b"tampered", &sig), Err(CryptoError::BadSignature));
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let a = SigKeyPair::generate();
        let b = SigKeyPair::generate();
        let sig = a.secret.sign(b"msg");
        assert!(b.public.verify(b"msg", &sig).is_err());
    }

    #[test]
    fn test_hex_length_checked() {
        let err = BoxPublicKey::from_hex("abcd").unwrap_err();
        assert_eq!(err, CryptoError::InvalidKeyLength { expected: 32, actual: 2 });
        assert!(matches!(
            SigSecretKey::from_hex("zz"),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn test_node_id_is_sha512_of_key() {
        let key = BoxPublicKey::from_bytes([7u8; 32]);
        let expected = Sha512::digest([7u8; 32]);
        assert_eq!(&NodeId::for_key(&key).as_bytes()[..], &expected[..]);
    }

    #[test]
    fn test_node_id_prev_borrows() {
        let mut bytes = [0u8; 64];
        bytes[62] = 1;
        let id = NodeId::from_bytes(bytes);
        let prev = id.prev();
        assert_eq!(prev.as_bytes()[62], 0);
        assert_eq!(prev.as_bytes()[63], 0xff);

        let zero = NodeId::from_bytes([0u8; 64]);
        assert_eq!(zero.prev(), NodeId::from_bytes([0xff; 64]));
    }

    #[test]
    fn test_masked_eq() {
        let a = NodeId::from_bytes([0xab; 64]);
        let mut other = [0xab; 64];
        other[63] = 0x00;
        let b = NodeId::from_bytes(other);

        let mut mask = [0xff; 64];
        mask[63] = 0;
        assert!(a.masked_eq(&b, &NodeId::from_bytes(mask)));
        assert!(!a.masked_eq(&b, &NodeId::full_mask()));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let kp = NodeKeys::generate();
        let dbg = format!("{:?}", kp);
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains(&kp.box_keys.secret.to_hex()));
    }
}
