//! Wire decoding errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Malformed varint")]
    BadVarint,

    #[error("Malformed coordinates")]
    BadCoords,

    #[error("Unknown packet type {0}")]
    UnknownType(u64),

    #[error("Unexpected packet type {0}")]
    UnexpectedType(u64),

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Bad frame magic")]
    BadMagic,
}
