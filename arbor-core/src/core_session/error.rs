use thiserror::Error;

use crate::core_router::RouterError;
use crate::core_search::SearchError;
use crate::crypto::BoxPublicKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("packet too big, maximum is {max}")]
    PacketTooBig { max: u16 },

    #[error("deadline exceeded")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("session is still searching for its remote node")]
    Searching,

    #[error("session handshake timed out")]
    HandshakeTimeout,

    #[error("a session with {0:?} already exists")]
    Exists(BoxPublicKey),

    #[error("cannot open a session to ourselves")]
    SelfSession,

    #[error("search failed: {0}")]
    Search(#[from] SearchError),

    #[error("send failed: {0}")]
    Send(String),
}

impl From<RouterError> for SessionError {
    fn from(e: RouterError) -> Self {
        SessionError::Send(e.to_string())
    }
}
