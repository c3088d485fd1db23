//! Tree coordinates

use crate::crypto::{SigPublicKey, TreeId};
use crate::wire::SwitchPort;

/// A node's position in the spanning tree: the root it follows, the root's
/// timestamp, and the ports on the path from the root down to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub root: SigPublicKey,
    pub tstamp: i64,
    pub coords: Vec<SwitchPort>,
}

impl Locator {
    pub fn new_root(root: SigPublicKey, tstamp: i64) -> Self {
        Self {
            root,
            tstamp,
            coords: Vec::new(),
        }
    }

    /// Tree distance from these coordinates to `dest`: the hops up to the
    /// common ancestor plus the hops back down.
    pub fn dist(&self, dest: &[SwitchPort]) -> usize {
        dist(&self.coords, dest)
    }

    /// True if this locator sits on the path from the root to `other`.
    pub fn is_ancestor_of(&self, other: &Locator) -> bool {
        self.root == other.root
            && self.coords.len() <= other.coords.len()
            && other.coords[..self.coords.len()] == self.coords[..]
    }

    /// Same root and path, regardless of timestamp.
    pub fn same_position(&self, other: &Locator) -> bool {
        self.root == other.root && self.coords == other.coords
    }
}

pub fn dist(a: &[SwitchPort], b: &[SwitchPort]) -> usize {
    let common = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    (a.len() - common) + (b.len() - common)
}

/// Root election order: the higher TreeID wins.
pub fn first_is_better(a: &SigPublicKey, b: &SigPublicKey) -> bool {
    TreeId::for_key(a) > TreeId::for_key(b)
}
