use core::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// A cluster participant. Fixed for the lifetime of a node.
pub type NodeId = u32;

const MAPPED_FLAG: u64 = 1 << 63;
const OBJECT_BITS: u32 = 31;
const OBJECT_MASK: u64 = (1 << OBJECT_BITS) - 1;
const NODE_MASK: u64 = 0xFFFF_FFFF;

/// Repository slot reserved so that no direct id is ever zero.
pub const NULL_SLOT: u32 = 0;
/// Repository slot naming the node itself, used as an affinity hint.
pub const AFFINITY_SLOT: u32 = 1;
/// Number of slots every repository reserves at start.
pub const RESERVED_SLOTS: u32 = 2;

/// Cluster-wide object identifier.
///
/// Layout, most significant bit first: `mapped | node (32) | object (31)`.
///
/// A *direct* id carries the owning node and its repository slot. A *mapped*
/// (labeled) id carries a map id and an index; its owner is a pure function
/// of the index, so any node can route to it without asking anyone.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
)]
#[archive(check_bytes)]
pub struct GlobalId(u64);

impl GlobalId {
    pub const NULL: GlobalId = GlobalId(0);
    /// Placeholder for a dependency slot that will be wired later.
    pub const UNINITIALIZED: GlobalId = GlobalId(u64::MAX);

    pub fn direct(node: NodeId, slot: u32) -> Self {
        debug_assert!(u64::from(slot) <= OBJECT_MASK);
        Self((u64::from(node) << OBJECT_BITS) | (u64::from(slot) & OBJECT_MASK))
    }

    pub fn mapped(map: u32, index: u32) -> Self {
        debug_assert!(u64::from(index) <= OBJECT_MASK);
        Self(
            MAPPED_FLAG
                | (u64::from(map) << OBJECT_BITS)
                | (u64::from(index) & OBJECT_MASK),
        )
    }

    /// The handle of a labeled range: all node bits set, map id in the
    /// object field.
    pub fn map_handle(map: u32) -> Self {
        Self((NODE_MASK << OBJECT_BITS) | (u64::from(map) & OBJECT_MASK))
    }

    /// The affinity hint naming `node`.
    pub fn node_hint(node: NodeId) -> Self {
        Self::direct(node, AFFINITY_SLOT)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_uninitialized(self) -> bool {
        self == Self::UNINITIALIZED
    }

    pub fn is_mapped(self) -> bool {
        self.0 & MAPPED_FLAG != 0 && !self.is_uninitialized()
    }

    pub fn is_map_handle(self) -> bool {
        !self.is_mapped()
            && !self.is_uninitialized()
            && self.node_field() == NODE_MASK as u32
    }

    fn node_field(self) -> u32 {
        ((self.0 >> OBJECT_BITS) & NODE_MASK) as u32
    }

    /// Object part: the repository slot of a direct id, the index of a
    /// mapped id.
    pub fn index(self) -> u32 {
        (self.0 & OBJECT_MASK) as u32
    }

    /// Map id of a mapped id or of a map handle.
    pub fn map_id(self) -> Option<u32> {
        if self.is_mapped() {
            Some(self.node_field())
        } else if self.is_map_handle() {
            Some(self.index())
        } else {
            None
        }
    }

    /// The node that owns the object. Never needs communication.
    pub fn owner(self, node_count: u32) -> NodeId {
        if self.is_mapped() {
            self.index() % node_count.max(1)
        } else if self.is_map_handle() {
            0
        } else {
            self.node_field()
        }
    }

    pub fn is_local(self, me: NodeId, node_count: u32) -> bool {
        !self.is_null() && self.owner(node_count) == me
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else if self.is_uninitialized() {
            write!(f, "uninit")
        } else if self.is_mapped() {
            write!(f, "m{}:{}", self.node_field(), self.index())
        } else if self.is_map_handle() {
            write!(f, "map{}", self.index())
        } else {
            write!(f, "n{}:{}", self.node_field(), self.index())
        }
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<GlobalId> for u64 {
    fn from(id: GlobalId) -> Self {
        id.0
    }
}

impl From<u64> for GlobalId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_owner_is_embedded_node() {
        for node in [0, 1, 7, 4096] {
            let id = GlobalId::direct(node, 42);
            assert_eq!(id.owner(8), node);
            assert_eq!(id.index(), 42);
            assert!(!id.is_mapped());
        }
    }

    #[test]
    fn test_mapped_owner_is_index_modulo_node_count() {
        let id = GlobalId::mapped(3, 10);
        assert!(id.is_mapped());
        assert_eq!(id.map_id(), Some(3));
        assert_eq!(id.owner(4), 2);
        assert_eq!(id.owner(5), 0);
        assert_eq!(id.owner(1), 0);
    }

    #[test]
    fn test_reserved_slots_never_produce_null() {
        assert!(GlobalId::direct(0, NULL_SLOT).is_null());
        assert!(!GlobalId::direct(0, RESERVED_SLOTS).is_null());
        assert_eq!(GlobalId::node_hint(3).owner(4), 3);
    }

    #[test]
    fn test_map_handle() {
        let handle = GlobalId::map_handle(9);
        assert!(handle.is_map_handle());
        assert!(!handle.is_mapped());
        assert_eq!(handle.map_id(), Some(9));
        assert!(!GlobalId::direct(2, 9).is_map_handle());
        assert!(!GlobalId::UNINITIALIZED.is_mapped());
    }
}
