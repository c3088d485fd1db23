/*
    Router - the boundary between the switch and the node's own services

    Inputs:
      - Packets the switch delivers to port 0 (the router channel)

    Outputs:
      - Traffic            -> session manager, looked up by handle
      - Protocol traffic   -> opened with the shared key for the sender's
                              permanent key, then
                                Ping / Pong   -> session manager
                                DHT request   -> DHT
                                DHT response  -> DHT

    Outgoing protocol traffic takes the other direction through `Outbound`,
    which seals with the same shared key and hands the packet to the switch
    as if it had arrived on port 0.
*/

mod outbound;
mod router;

pub use outbound::Outbound;
pub use router::Router;

use thiserror::Error;

use crate::core_switch::SwitchError;
use crate::crypto::CryptoError;
use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("switch: {0}")]
    Switch(#[from] SwitchError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("router stopped")]
    Stopped,
}
