//! Ring geometry over the NodeID space
//!
//! There is no modulus: positions are 512-bit big-endian numbers and the
//! ring wraps from all-ones back to zero.

use std::cmp::Ordering;

use crate::crypto::{NodeId, NODE_ID_LEN};

/// True if `b` lies strictly between `a` and `c`, going clockwise from `a`.
pub fn dht_ordered(a: &NodeId, b: &NodeId, c: &NodeId) -> bool {
    (a < b && b < c) || (c < a && a < b) || (b < c && c < a)
}

/// Clockwise distance from `from` to `to`, i.e. `(to - from) mod 2^512`.
pub fn clockwise(from: &NodeId, to: &NodeId) -> [u8; NODE_ID_LEN] {
    let a = from.as_bytes();
    let b = to.as_bytes();
    let mut out = [0u8; NODE_ID_LEN];
    let mut borrow = 0u16;
    for i in (0..NODE_ID_LEN).rev() {
        let lhs = u16::from(b[i]);
        let rhs = u16::from(a[i]) + borrow;
        if lhs >= rhs {
            out[i] = (lhs - rhs) as u8;
            borrow = 0;
        } else {
            out[i] = (lhs + 256 - rhs) as u8;
            borrow = 1;
        }
    }
    out
}

/// How far `id` is from `center` in whichever direction is shorter.
pub fn ring_gap(center: &NodeId, id: &NodeId) -> [u8; NODE_ID_LEN] {
    let ahead = clockwise(center, id);
    let behind = clockwise(id, center);
    std::cmp::min(ahead, behind)
}

/// Order candidates by how closely they precede `target`: `a` comes first if
/// it lies between `b` and `target`.
pub fn closer_to(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    clockwise(a, target).cmp(&clockwise(b, target))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn node_id() -> impl Strategy<Value = NodeId> {
        prop::collection::vec(any::<u8>(), NODE_ID_LEN).prop_map(|v| {
            let mut bytes = [0u8; NODE_ID_LEN];
            bytes.copy_from_slice(&v);
            NodeId::from_bytes(bytes)
        })
    }

    // Property: for distinct points exactly one of the two cyclic
    // orientations holds, and it is invariant under rotation
    proptest! {
        #[test]
        fn prop_single_cyclic_order(a in node_id(), b in node_id(), c in node_id()) {
            prop_assume!(a != b && b != c && a != c);
            let forward = dht_ordered(&a, &b, &c);
            let backward = dht_ordered(&a, &c, &b);
            prop_assert!(forward != backward);
            prop_assert_eq!(forward, dht_ordered(&b, &c, &a));
            prop_assert_eq!(forward, dht_ordered(&c, &a, &b));
        }
    }

    // Property: betweenness agrees with clockwise distances
    proptest! {
        #[test]
        fn prop_ordered_matches_distance(a in node_id(), b in node_id(), c in node_id()) {
            prop_assume!(a != b && b != c && a != c);
            let via_distance = clockwise(&a, &b) < clockwise(&a, &c);
            prop_assert_eq!(dht_ordered(&a, &b, &c), via_distance);
        }
    }
}
