//! Crypto error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Encryption failed")]
    SealFailed,

    #[error("Decryption failed")]
    OpenFailed,
}
