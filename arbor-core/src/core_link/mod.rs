//! Peer links
//!
//! One link per connection. A link runs the metadata handshake, registers
//! with the switch, and then relays two kinds of traffic over a framed
//! byte stream: sealed spanning-tree announcements (link protocol) and
//! routed packets.
//!
//! - `metadata`: handshake block and version check
//! - `stream`: frame encoding on top of any `AsyncRead + AsyncWrite`
//! - `link`: the per-connection reader/writer tasks
//! - `manager`: TCP listeners, dialing and the inbound allow-list

pub mod link;
pub mod manager;
pub mod metadata;
pub mod stream;

pub use link::{establish, verify_announcement, EstablishedLink, LinkContext};
pub use manager::{parse_uri, AllowedKeys, LinkManager};
pub use metadata::{LinkMetadata, METADATA_LEN, PROTOCOL_MAJOR, PROTOCOL_MINOR};
pub use stream::{encode_frame, FrameReader, MAX_FRAME_LEN, STREAM_MAGIC};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::core_switch::SwitchError;
use crate::crypto::{BoxPublicKey, CryptoError};
use crate::wire::{SwitchMsg, WireError};

/// Control messages from the switch to a link. These jump ahead of queued
/// packets.
#[derive(Debug)]
pub enum LinkCommand {
    /// Sign our hop onto the announcement and send it
    SendSwitchMsg(SwitchMsg),
    Close,
}

/// The switch's side of a link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    /// Remote address, for introspection
    pub remote: String,
    pub control: mpsc::Sender<LinkCommand>,
    pub packets: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("bad metadata magic")]
    BadMetadata,

    #[error("peer runs newer protocol {major}.{minor}")]
    Version { major: u64, minor: u64 },

    #[error("connected to ourselves")]
    SelfLink,

    #[error("box key {0} is not allowed")]
    NotAllowed(BoxPublicKey),

    #[error("bad frame magic")]
    BadMagic,

    #[error("frame of {size} bytes exceeds {max}")]
    FrameTooLarge { size: u64, max: usize },

    #[error("malformed message: {0}")]
    Wire(#[from] WireError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid announcement: {0}")]
    BadAnnouncement(&'static str),

    #[error("nothing received for {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("switch: {0}")]
    Switch(#[from] SwitchError),

    #[error("invalid peer URI: {0}")]
    InvalidUri(String),

    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// Short label for the handshake metric.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::Io(_) => "io",
            LinkError::HandshakeTimeout => "timeout",
            LinkError::BadMetadata => "bad_metadata",
            LinkError::Version { .. } => "version",
            LinkError::SelfLink => "self",
            LinkError::NotAllowed(_) => "not_allowed",
            LinkError::Switch(SwitchError::DuplicatePeer(_)) => "duplicate",
            _ => "other",
        }
    }
}
