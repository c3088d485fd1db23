//! Test fixtures for creating common test objects
//!
//! Builders for configs with short timers, node keys and signed switch
//! announcements.

use std::time::Duration;

use crate::config::Config;
use crate::crypto::{BoxKeyPair, BoxPublicKey, NodeKeys, SigKeyPair, SigPublicKey};
use crate::wire::{hop_signing_bytes, SwitchMsg, SwitchMsgHop, SwitchPort};

/// Builder for node configs whose timers suit in-process tests
pub struct TestConfigBuilder {
    config: Config,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = Config::default();

        config.node.shutdown_timeout = Duration::from_secs(2);

        config.link.handshake_timeout = Duration::from_secs(3);
        config.link.keepalive_interval = Duration::from_millis(500);
        config.link.idle_timeout = Duration::from_secs(5);
        config.link.reconnect_interval = Duration::from_millis(200);

        config.switch.timeout = Duration::from_secs(10);
        config.switch.update_interval = Duration::from_secs(4);
        config.switch.throttle = Duration::from_secs(1);
        config.switch.maintenance_interval = Duration::from_millis(100);

        config.dht.maintenance_interval = Duration::from_millis(200);
        config.dht.max_ping_throttle = Duration::from_secs(2);

        config.session.ping_after = Duration::from_secs(1);
        config.session.search_after = Duration::from_secs(1);
        config.session.ping_interval = Duration::from_millis(200);
        config.session.search_timeout = Duration::from_secs(3);
        config.session.search_retry = Duration::from_millis(200);
        config.session.handshake_timeout = Duration::from_secs(3);
        config.session.workers = 2;

        Self { config }
    }

    pub fn with_keys(mut self, keys: &NodeKeys) -> Self {
        self.config.node.box_private_key = keys.box_keys.secret.to_hex();
        self.config.node.signing_private_key = keys.sig_keys.secret.to_hex();
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.config.node.mtu = mtu;
        self
    }

    pub fn with_peer(mut self, uri: impl Into<String>) -> Self {
        self.config.node.peers.push(uri.into());
        self
    }

    pub fn with_allowed_key(mut self, key: &BoxPublicKey) -> Self {
        self.config.node.allowed_box_keys.push(key.to_hex());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for switch announcements signed hop by hop.
///
/// Each hop is signed by the node sending it, over the path so far.
pub struct TestSwitchMsgBuilder {
    msg: SwitchMsg,
}

impl TestSwitchMsgBuilder {
    pub fn new(root: &SigPublicKey, tstamp: i64) -> Self {
        Self {
            msg: SwitchMsg {
                root: *root,
                tstamp,
                hops: Vec::new(),
            },
        }
    }

    /// Append a hop sent by `from` out of its port `port` towards `next`.
    pub fn hop(mut self, from: &SigKeyPair, port: SwitchPort, next: &SigPublicKey) -> Self {
        let bytes = hop_signing_bytes(next, &self.msg.root, self.msg.tstamp, &self.msg.coords());
        self.msg.hops.push(SwitchMsgHop {
            port,
            next: *next,
            sig: from.secret.sign(&bytes),
        });
        self
    }

    pub fn build(self) -> SwitchMsg {
        self.msg
    }
}

/// Quick fixture functions for common test objects

pub fn test_config() -> Config {
    TestConfigBuilder::new().build()
}

pub fn test_node_keys() -> NodeKeys {
    NodeKeys::generate()
}

pub fn test_box_key() -> BoxPublicKey {
    BoxKeyPair::generate().public
}

pub fn test_sig_keys() -> SigKeyPair {
    SigKeyPair::generate()
}

/// `n` node keys sorted by ascending NodeID.
pub fn test_node_keys_by_id(n: usize) -> Vec<NodeKeys> {
    let mut keys: Vec<NodeKeys> = (0..n).map(|_| NodeKeys::generate()).collect();
    keys.sort_by_key(|k| k.node_id());
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_valid() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert!(config.link.keepalive_interval < config.link.idle_timeout);
    }

    #[test]
    fn test_config_keys_round_trip() {
        let keys = test_node_keys();
        let config = TestConfigBuilder::new().with_keys(&keys).build();
        let loaded = config.node_keys().unwrap();
        assert_eq!(loaded.box_keys.public, keys.box_keys.public);
        assert_eq!(loaded.sig_keys.public, keys.sig_keys.public);
    }

    #[test]
    fn test_switch_msg_builder_signs_each_hop() {
        let root = test_sig_keys();
        let middle = test_sig_keys();
        let leaf = test_sig_keys();
        let msg = TestSwitchMsgBuilder::new(&root.public, 7)
            .hop(&root, 3, &middle.public)
            .hop(&middle, 5, &leaf.public)
            .build();

        assert_eq!(msg.coords(), vec![3, 5]);
        let first = msg.bytes_for_hop(0).unwrap();
        let second = msg.bytes_for_hop(1).unwrap();
        assert!(root.public.verify(&first, &msg.hops[0].sig).is_ok());
        assert!(middle.public.verify(&second, &msg.hops[1].sig).is_ok());
        assert!(root.public.verify(&second, &msg.hops[1].sig).is_err());
    }

    #[test]
    fn test_keys_sorted_by_node_id() {
        let keys = test_node_keys_by_id(5);
        for pair in keys.windows(2) {
            assert!(pair[0].node_id() <= pair[1].node_id());
        }
    }
}
