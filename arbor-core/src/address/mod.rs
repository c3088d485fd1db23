/*
    Address - IPv6 identifiers derived from NodeIDs

    Every node owns one /128 address and one /64 subnet inside fd00::/8.
    Both are computed from the NodeID, so holding the box key is the only
    proof of ownership needed.

    Layout (bits after the 8-bit prefix):
      - first byte: number of leading 1-bits in the NodeID, with the high
        bit clear for an address and set for a subnet
      - remaining bytes: the NodeID bits that follow the first 0-bit

    Workflow:
      1. address_for_node_id()/subnet_for_node_id() when a node starts
      2. node_id_and_mask() when dialing an address, to recover the prefix
         of the NodeID it stands for; the search then matches that prefix
*/

use std::fmt;
use std::net::Ipv6Addr;

use crate::crypto::{BoxPublicKey, NodeId, NODE_ID_LEN};

/// Leading byte of every address and subnet.
pub const ADDRESS_PREFIX: u8 = 0xfd;

const SUBNET_FLAG: u8 = 0x80;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 16]);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet([u8; 8]);

/// Count leading ones, and collect the bits after the first zero.
fn squash(node_id: &NodeId, out: &mut [u8]) -> u8 {
    let mut ones: u8 = 0;
    let mut done = false;
    let mut bits: u8 = 0;
    let mut n_bits = 0;
    let mut idx = 0;

    for i in 0..NODE_ID_LEN * 8 {
        let bit = (node_id.as_bytes()[i / 8] & (0x80 >> (i % 8))) >> (7 - (i % 8));
        if !done && bit != 0 {
            ones = ones.saturating_add(1);
            continue;
        }
        if !done && bit == 0 {
            done = true;
            continue;
        }
        bits = (bits << 1) | bit;
        n_bits += 1;
        if n_bits == 8 {
            if idx >= out.len() {
                break;
            }
            out[idx] = bits;
            idx += 1;
            n_bits = 0;
            bits = 0;
        }
    }
    ones
}

impl Address {
    pub fn for_node_id(node_id: &NodeId) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0] = ADDRESS_PREFIX;
        bytes[1] = squash(node_id, &mut bytes[2..]) & !SUBNET_FLAG;
        Self(bytes)
    }

    pub fn for_key(key: &BoxPublicKey) -> Self {
        Self::for_node_id(&NodeId::for_key(key))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX && self.0[1] & SUBNET_FLAG == 0
    }

    /// The NodeID prefix this address commits to, and a mask selecting the
    /// bits that are actually known.
    pub fn node_id_and_mask(&self) -> (NodeId, NodeId) {
        expand(self.0[1] & !SUBNET_FLAG, &self.0[2..])
    }
}

impl Subnet {
    pub fn for_node_id(node_id: &NodeId) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0] = ADDRESS_PREFIX;
        bytes[1] = squash(node_id, &mut bytes[2..]) | SUBNET_FLAG;
        Self(bytes)
    }

    pub fn for_key(key: &BoxPublicKey) -> Self {
        Self::for_node_id(&NodeId::for_key(key))
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX && self.0[1] & SUBNET_FLAG != 0
    }

    pub fn node_id_and_mask(&self) -> (NodeId, NodeId) {
        expand(self.0[1] & !SUBNET_FLAG, &self.0[2..])
    }

    /// True if `addr` belongs to this /64.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..8] == self.0
    }
}

fn expand(ones: u8, tail: &[u8]) -> (NodeId, NodeId) {
    let mut id = [0u8; NODE_ID_LEN];
    let mut mask = [0u8; NODE_ID_LEN];
    let ones = ones as usize;

    for i in 0..ones.min(NODE_ID_LEN * 8) {
        id[i / 8] |= 0x80 >> (i % 8);
    }
    // the zero that terminated the run of ones
    let known = (ones + 1 + tail.len() * 8).min(NODE_ID_LEN * 8);
    for i in 0..known {
        mask[i / 8] |= 0x80 >> (i % 8);
    }

    let offset = ones + 1;
    for i in 0..tail.len() * 8 {
        let pos = offset + i;
        if pos >= NODE_ID_LEN * 8 {
            break;
        }
        let bit = (tail[i / 8] & (0x80 >> (i % 8))) != 0;
        if bit {
            id[pos / 8] |= 0x80 >> (pos % 8);
        }
    }
    (NodeId::from_bytes(id), NodeId::from_bytes(mask))
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        Ipv6Addr::from(addr.0)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(addr: Ipv6Addr) -> Self {
        Address(addr.octets())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv6Addr::from(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut full = [0u8; 16];
        full[..8].copy_from_slice(&self.0);
        write!(f, "{}/64", Ipv6Addr::from(full))
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BoxKeyPair;

    fn id_with(bytes: &[(usize, u8)]) -> NodeId {
        let mut raw = [0u8; NODE_ID_LEN];
        for (i, b) in bytes {
            raw[*i] = *b;
        }
        NodeId::from_bytes(raw)
    }

    #[test]
    fn test_address_layout() {
        // 0b1110_1010 ...: three leading ones, then 1010 continues
        let id = id_with(&[(0, 0b1110_1010), (1, 0xff)]);
        let addr = Address::for_node_id(&id);
        assert_eq!(addr.as_bytes()[0], 0xfd);
        assert_eq!(addr.as_bytes()[1], 3);
        // bits after the first zero: 1010 then 1111 1111 ...
        assert_eq!(addr.as_bytes()[2], 0b1010_1111);
        assert!(addr.is_valid());
    }

    #[test]
    fn test_subnet_flag() {
        let key = BoxKeyPair::generate().public;
        let subnet = Subnet::for_key(&key);
        let addr = Address::for_key(&key);
        assert!(subnet.is_valid());
        assert!(!Address::from_bytes({
            let mut b = [0u8; 16];
            b[..8].copy_from_slice(subnet.as_bytes());
            b
        })
        .is_valid());
        assert_eq!(subnet.as_bytes()[1] & 0x7f, addr.as_bytes()[1]);
        assert_eq!(&subnet.as_bytes()[2..], &addr.as_bytes()[2..8]);
    }

    #[test]
    fn test_node_id_and_mask_matches_source() {
        for _ in 0..32 {
            let key = BoxKeyPair::generate().public;
            let node_id = NodeId::for_key(&key);

            let (id, mask) = Address::for_key(&key).node_id_and_mask();
            assert!(id.masked_eq(&node_id, &mask));

            let (id, mask) = Subnet::for_key(&key).node_id_and_mask();
            assert!(id.masked_eq(&node_id, &mask));
        }
    }

    #[test]
    fn test_mask_width() {
        let id = id_with(&[(0, 0b1100_0000)]);
        let (_, mask) = Address::for_node_id(&id).node_id_and_mask();
        // two ones, the zero, and 14 bytes of tail
        let known_bits: u32 = mask.as_bytes().iter().map(|b| b.count_ones()).sum();
        assert_eq!(known_bits, 2 + 1 + 14 * 8);
    }

    #[test]
    fn test_display_and_contains() {
        let key = BoxKeyPair::generate().public;
        let addr = Address::for_key(&key);
        let subnet = Subnet::for_key(&key);
        assert!(addr.to_string().starts_with("fd"));
        assert!(subnet.to_string().ends_with("/64"));

        let mut inside = [0u8; 16];
        inside[..8].copy_from_slice(subnet.as_bytes());
        inside[15] = 1;
        assert!(subnet.contains(&Ipv6Addr::from(inside)));
        assert!(!subnet.contains(&Ipv6Addr::from(addr)));
    }
}
