//! Arbor: an encrypted overlay network node.
//!
//! Nodes link over TCP (or any byte stream), build a spanning tree to get
//! routable coordinates, find each other through a DHT keyed by NodeID and
//! talk over end-to-end encrypted sessions. `node::Node` wires it all up.

pub mod address;
pub mod config;
pub mod core_dht;
pub mod core_link;
pub mod core_router;
pub mod core_search;
pub mod core_session;
pub mod core_switch;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod shutdown;
pub mod test_utils;
pub mod wire;

pub use address::{Address, Subnet};
pub use config::Config;
pub use core_session::{Conn, SessionError};
pub use logging::{init_logging, LogLevel};
pub use node::{Node, NodeError, PeerInfo, SelfInfo};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
