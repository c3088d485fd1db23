//! Authenticated encryption between two box keys.
//!
//! The shared key is X25519(ours, theirs) run through HKDF-SHA256, and
//! payloads are sealed with XChaCha20-Poly1305 under a 24-byte nonce that
//! travels in the clear next to the ciphertext.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::CryptoError;
use super::keys::{BoxPublicKey, BoxSecretKey};

pub const BOX_NONCE_LEN: usize = 24;
pub const BOX_OVERHEAD: usize = 16;
pub const SHARED_KEY_LEN: usize = 32;

const KDF_INFO: &[u8] = b"arbor box shared key v1";

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_LEN]);

impl SharedKey {
    /// Derive the symmetric key for traffic between `ours` and `theirs`.
    /// Both ends derive the same key.
    pub fn derive(ours: &BoxSecretKey, theirs: &BoxPublicKey) -> Self {
        let mut dh = ours.diffie_hellman(theirs);
        let hk = Hkdf::<Sha256>::new(None, &dh);
        dh.zeroize();
        let mut okm = [0u8; SHARED_KEY_LEN];
        // 32 bytes is always a valid HKDF-SHA256 output length
        let _ = hk.expand(KDF_INFO, &mut okm);
        Self(okm)
    }

    pub fn seal(&self, plaintext: &[u8], nonce: &BoxNonce) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .encrypt(XNonce::from_slice(&nonce.0), plaintext)
            .map_err(|_| CryptoError::SealFailed)
    }

    pub fn open(&self, ciphertext: &[u8], nonce: &BoxNonce) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(XNonce::from_slice(&nonce.0), ciphertext)
            .map_err(|_| CryptoError::OpenFailed)
    }

    /// Seal under a freshly drawn nonce, for one-off messages with no
    /// ongoing counter.
    pub fn seal_fresh(&self, plaintext: &[u8]) -> Result<(Vec<u8>, BoxNonce), CryptoError> {
        let mut nonce = BoxNonce::random();
        nonce.advance();
        let sealed = self.seal(plaintext, &nonce)?;
        Ok((sealed, nonce))
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// 24-byte nonce, treated as a big-endian counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxNonce([u8; BOX_NONCE_LEN]);

impl BoxNonce {
    /// How far two nonces may be compared before the difference saturates.
    pub const WINDOW: i64 = 64;

    pub fn from_bytes(bytes: [u8; BOX_NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; BOX_NONCE_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; BOX_NONCE_LEN] {
        &self.0
    }

    /// A random nonce with room left to count upward.
    pub fn random() -> Self {
        let mut bytes = [0u8; BOX_NONCE_LEN];
        loop {
            rand::rng().fill_bytes(&mut bytes);
            if bytes[0] != 0xff {
                return Self(bytes);
            }
        }
    }

    /// Step forward by two, keeping the low bit. Re-randomizes (same parity)
    /// once the counter gets near the top of its range.
    pub fn advance(&mut self) {
        if self.0[0] == 0xff {
            let odd = self.is_odd();
            *self = Self::random();
            self.set_parity(odd);
        }
        let mut carry = 2u16;
        for b in self.0.iter_mut().rev() {
            let sum = *b as u16 + carry;
            *b = sum as u8;
            carry = sum >> 8;
            if carry == 0 {
                break;
            }
        }
    }

    pub fn is_odd(&self) -> bool {
        self.0[BOX_NONCE_LEN - 1] & 1 == 1
    }

    pub fn set_parity(&mut self, odd: bool) {
        let last = &mut self.0[BOX_NONCE_LEN - 1];
        if odd {
            *last |= 1;
        } else {
            *last &= !1;
        }
    }

    /// `self - other`, saturated to `[-WINDOW, WINDOW]`.
    pub fn minus(&self, other: &BoxNonce) -> i64 {
        let mut diff: i64 = 0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff = diff * 256 + (*a as i64 - *b as i64);
            if diff > Self::WINDOW {
                return Self::WINDOW;
            }
            if diff < -Self::WINDOW {
                return -Self::WINDOW;
            }
        }
        diff
    }
}

impl fmt::Debug for BoxNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxNonce({})", hex::encode(&self.0[16..]))
    }
}
