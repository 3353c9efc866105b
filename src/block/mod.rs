//! Replicated data blocks.
//!
//! Every block has one *owner*, the node whose repository holds it, which
//! arbitrates where the single *master* replica lives. Other nodes hold
//! read-only *copies* or nothing at all. All state changes happen under the
//! block's own lock; anything that must leave the lock (messages, grants to
//! waiting tasks) is returned as an [`Effect`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rkyv::{Archive, Deserialize, Serialize};

use crate::{
    directory::{read, write},
    error::Error,
    id::{GlobalId, NodeId},
};

mod data;
mod replication;

pub use data::DataBlock;
pub use replication::{MasterActivity, Target};

/// How a task uses a block. Ordered by strength for [`combine`].
#[repr(u8)]
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub enum AccessMode {
    /// The slot carries the id only; nothing is acquired.
    Null = 0,
    /// Shared read.
    Ro = 1,
    /// Shared write; concurrent writers see each other's changes.
    Rw = 2,
    /// Read of a snapshot no one writes to while it is held.
    Const = 3,
    /// Exclusive write.
    Ew = 4,
}

impl AccessMode {
    pub const DEFAULT: AccessMode = AccessMode::Rw;

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Rw | AccessMode::Ew)
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for AccessMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessMode::Null),
            1 => Ok(AccessMode::Ro),
            2 => Ok(AccessMode::Rw),
            3 => Ok(AccessMode::Const),
            4 => Ok(AccessMode::Ew),
            _ => Err(Error::MalformedMessage("unknown access mode")),
        }
    }
}

/// The mode a task needs when it names the same block in two slots.
///
/// The stronger mode wins, except that a consistent read combined with a
/// shared write becomes an exclusive write.
pub fn combine(a: AccessMode, b: AccessMode) -> AccessMode {
    use AccessMode::*;
    match (a, b) {
        (Const, Rw) | (Rw, Const) => Ew,
        _ => a.max(b),
    }
}

/// Replication state of a block on one node.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    Invalid = 0,
    Copy = 1,
    Master = 2,
}

impl TryFrom<u8> for ReplicaState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReplicaState::Invalid),
            1 => Ok(ReplicaState::Copy),
            2 => Ok(ReplicaState::Master),
            _ => Err(Error::MalformedMessage("unknown replica state")),
        }
    }
}

/// Node-to-node replication traffic for one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockMessage {
    /// To the owner: make `node` a copy or the master.
    ElevationRequest { node: NodeId, level: ReplicaState },
    /// To the master: step down once pending work drains.
    ReleaseMasterRequest,
    /// To the owner: the outgoing master's copy list, itself included.
    CopylistReleased(Vec<NodeId>),
    /// To the incoming master: take over with this copy list.
    TakeMaster(Vec<NodeId>),
    /// To a copy: send your data to the incoming master.
    TransferDataToNewMaster { recipient: NodeId },
    /// To the master: send a copy to `recipient`.
    TransferDataToCopy { recipient: NodeId },
    /// Contents for an incoming master.
    Data(Vec<u8>),
    /// Contents for a new copy.
    DataCopy(Vec<u8>),
    CopyReceived,
    /// To the owner: the incoming master is ready.
    IsMaster,
    InvalidateCopy,
    CopyInvalidated,
}

/// What a block asks its node to do once the block lock is released.
#[derive(Debug)]
pub enum Effect {
    Send { to: NodeId, msg: BlockMessage },
    /// A waiting task got its lock.
    Granted { task: GlobalId, buffer: Option<Buffer> },
    /// Every copy a task's write invalidated has acknowledged.
    RemoteUpdated(GlobalId),
}

/// Block contents. Replacing a block's buffer never disturbs tasks that
/// already hold a handle to the previous one.
#[derive(Clone)]
pub struct Buffer(Arc<RwLock<Box<[u8]>>>);

impl Buffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(data.into_boxed_slice())))
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        read(&self.0)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        write(&self.0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read().to_vec()
    }

    pub fn same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Buffer({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AccessMode::*;

    const ALL: [AccessMode; 5] = [Null, Ro, Rw, Const, Ew];

    #[test]
    fn test_combine_is_idempotent() {
        for m in ALL {
            assert_eq!(combine(m, m), m);
        }
    }

    #[test]
    fn test_combine_with_null_is_identity() {
        for m in ALL {
            assert_eq!(combine(m, Null), m);
            assert_eq!(combine(Null, m), m);
        }
    }

    #[test]
    fn test_combine_is_commutative() {
        for a in ALL {
            for b in ALL {
                assert_eq!(combine(a, b), combine(b, a));
            }
        }
    }

    #[test]
    fn test_const_and_rw_escalate_to_ew() {
        assert_eq!(combine(Const, Rw), Ew);
        assert_eq!(combine(Rw, Const), Ew);
        assert_eq!(combine(Ro, Rw), Rw);
        assert_eq!(combine(Ro, Const), Const);
    }

    #[test]
    fn test_buffer_handles_share_contents() {
        let a = Buffer::from_vec(vec![1, 2, 3]);
        let b = a.clone();
        b.write()[0] = 9;
        assert_eq!(a.to_vec(), vec![9, 2, 3]);
        assert!(a.same(&b));
        assert!(!a.same(&Buffer::zeroed(3)));
    }
}
