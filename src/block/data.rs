use std::collections::VecDeque;

use super::{
    replication::{MasterActivity, Target},
    AccessMode, Buffer, ReplicaState,
};
use crate::{
    checkpoint::{Checkpoint, Reader, Writer},
    error::Error,
    id::{GlobalId, NodeId},
};

/// Lock counters of one replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Locks {
    pub shared_read: u32,
    pub shared_write: u32,
    pub exclusive: u32,
    pub exclusive_write: bool,
}

impl Locks {
    pub fn is_free(&self) -> bool {
        self.shared_read == 0 && self.shared_write == 0 && self.exclusive == 0
    }

    pub fn has_writers(&self) -> bool {
        self.shared_write > 0 || self.exclusive_write
    }
}

/// Bookkeeping only the master replica uses.
#[derive(Debug, Default)]
pub(crate) struct MasterData {
    pub activity: MasterActivity,
    pub copy_waitlist: VecDeque<NodeId>,
    pub pending_copies: u32,
    pub pending_invalidations: u32,
    pub tasks_waiting_for_invalidation: Vec<GlobalId>,
}

/// Bookkeeping only the owning node uses.
#[derive(Debug)]
pub(crate) struct OwnerData {
    /// `None` while mastership is in transit.
    pub master: Option<Target>,
    pub target: Target,
    pub master_waitlist: VecDeque<Target>,
    pub copy_waitlist: VecDeque<NodeId>,
}

impl OwnerData {
    fn mastered_by(node: NodeId) -> Self {
        Self {
            master: Some(Target::Node(node)),
            target: Target::Node(node),
            master_waitlist: VecDeque::new(),
            copy_waitlist: VecDeque::new(),
        }
    }
}

/// One node's replica of a data block.
pub struct DataBlock {
    pub(crate) id: GlobalId,
    pub(crate) me: NodeId,
    pub(crate) owner: NodeId,
    pub(crate) len: u64,
    pub(crate) allocator: u64,
    pub(crate) flags: u16,
    pub(crate) buffer: Option<Buffer>,
    pub(crate) destroyed: bool,
    pub(crate) state: ReplicaState,
    pub(crate) locks: Locks,
    pub(crate) waitlist: VecDeque<(GlobalId, AccessMode)>,
    pub(crate) has_copylist: bool,
    pub(crate) copylist: Vec<NodeId>,
    pub(crate) master_data: MasterData,
    pub(crate) owner_data: OwnerData,
}

impl DataBlock {
    /// A freshly created block: master on its creating node, zero filled.
    pub fn new(
        id: GlobalId,
        me: NodeId,
        owner: NodeId,
        len: u64,
        flags: u16,
        allocator: u64,
    ) -> Self {
        Self::with_buffer(id, me, owner, Buffer::zeroed(len as usize), flags, allocator)
    }

    /// A master block holding `data`.
    pub fn with_data(
        id: GlobalId,
        me: NodeId,
        owner: NodeId,
        data: Vec<u8>,
        flags: u16,
        allocator: u64,
    ) -> Self {
        Self::with_buffer(id, me, owner, Buffer::from_vec(data), flags, allocator)
    }

    fn with_buffer(
        id: GlobalId,
        me: NodeId,
        owner: NodeId,
        buffer: Buffer,
        flags: u16,
        allocator: u64,
    ) -> Self {
        Self {
            id,
            me,
            owner,
            len: buffer.len() as u64,
            allocator,
            flags,
            buffer: Some(buffer),
            destroyed: false,
            state: ReplicaState::Master,
            locks: Locks::default(),
            waitlist: VecDeque::new(),
            has_copylist: true,
            copylist: Vec::new(),
            master_data: MasterData::default(),
            owner_data: OwnerData::mastered_by(me),
        }
    }

    /// A replica with no data yet, mastered on `master`.
    pub fn invalid(
        id: GlobalId,
        me: NodeId,
        owner: NodeId,
        len: u64,
        allocator: u64,
        master: NodeId,
    ) -> Self {
        Self {
            id,
            me,
            owner,
            len,
            allocator,
            flags: 0,
            buffer: None,
            destroyed: false,
            state: ReplicaState::Invalid,
            locks: Locks::default(),
            waitlist: VecDeque::new(),
            has_copylist: false,
            copylist: Vec::new(),
            master_data: MasterData::default(),
            owner_data: OwnerData::mastered_by(master),
        }
    }

    pub fn id(&self) -> GlobalId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocator(&self) -> u64 {
        self.allocator
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn is_owner(&self) -> bool {
        self.me == self.owner
    }

    /// Tasks waiting for a lock, oldest first.
    pub fn waiting(&self) -> impl Iterator<Item = &(GlobalId, AccessMode)> {
        self.waitlist.iter()
    }
}

impl core::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataBlock")
            .field("id", &self.id)
            .field("me", &self.me)
            .field("owner", &self.owner)
            .field("len", &self.len)
            .field("state", &self.state)
            .field("locks", &self.locks)
            .field("copylist", &self.copylist)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

const NO_TARGET: u64 = u64::MAX;
const DESTROY_TARGET: u64 = u64::MAX - 1;

fn target_value(target: Option<Target>) -> u64 {
    match target {
        None => NO_TARGET,
        Some(Target::Destroy) => DESTROY_TARGET,
        Some(Target::Node(node)) => u64::from(node),
    }
}

fn target_from(value: u64) -> Result<Option<Target>, Error> {
    match value {
        NO_TARGET => Ok(None),
        DESTROY_TARGET => Ok(Some(Target::Destroy)),
        node => NodeId::try_from(node)
            .map(|node| Some(Target::Node(node)))
            .map_err(|_| Error::Checkpoint("master target out of range".into())),
    }
}

impl Checkpoint for Target {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("target", target_value(Some(*self)));
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        target_from(r.read_value("target")?)?
            .ok_or_else(|| Error::Checkpoint("missing master target".into()))
    }
}

impl Checkpoint for DataBlock {
    fn save<W: Writer>(&self, w: &mut W) {
        self.id.save(w);
        w.write_value("me", u64::from(self.me));
        w.write_value("owner", u64::from(self.owner));
        w.write_value("len", self.len);
        w.write_value("allocator", self.allocator);
        w.write_value("flags", u64::from(self.flags));
        match &self.buffer {
            Some(buffer) => {
                w.write_value("has_buffer", 1);
                w.write_bytes("buffer", &buffer.read());
            }
            None => w.write_value("has_buffer", 0),
        }
        w.write_value("destroyed", self.destroyed as u64);
        w.write_value("state", self.state as u64);
        w.write_value("shared_read", u64::from(self.locks.shared_read));
        w.write_value("shared_write", u64::from(self.locks.shared_write));
        w.write_value("exclusive", u64::from(self.locks.exclusive));
        w.write_value("exclusive_write", self.locks.exclusive_write as u64);
        w.write_sequence("waitlist", &self.waitlist);
        w.write_value("has_copylist", self.has_copylist as u64);
        w.write_sequence("copylist", &self.copylist);

        let master = &self.master_data;
        let activity = match master.activity {
            MasterActivity::Idle => 0,
            MasterActivity::Writing => 1,
            MasterActivity::Invalidating => 2,
            MasterActivity::WritingAndInvalidating => 3,
        };
        w.write_value("activity", activity);
        w.write_sequence("copy_waitlist", &master.copy_waitlist);
        w.write_value("pending_copies", u64::from(master.pending_copies));
        w.write_value("pending_invalidations", u64::from(master.pending_invalidations));
        w.write_sequence("tasks_waiting_for_invalidation", &master.tasks_waiting_for_invalidation);

        let owner = &self.owner_data;
        w.write_value("master", target_value(owner.master));
        owner.target.save(w);
        w.write_sequence("master_waitlist", &owner.master_waitlist);
        w.write_sequence("owner_copy_waitlist", &owner.copy_waitlist);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        let id = GlobalId::load(r)?;
        let me = r.read_u32("me")?;
        let owner = r.read_u32("owner")?;
        let len = r.read_value("len")?;
        let allocator = r.read_value("allocator")?;
        let flags = r.read_value("flags")? as u16;
        let buffer = match r.read_bool("has_buffer")? {
            true => Some(Buffer::from_vec(r.read_bytes("buffer")?)),
            false => None,
        };
        let destroyed = r.read_bool("destroyed")?;
        let state = ReplicaState::try_from(r.read_value("state")? as u8)?;
        let locks = Locks {
            shared_read: r.read_u32("shared_read")?,
            shared_write: r.read_u32("shared_write")?,
            exclusive: r.read_u32("exclusive")?,
            exclusive_write: r.read_bool("exclusive_write")?,
        };
        let waitlist = r.read_sequence::<(GlobalId, AccessMode)>("waitlist")?.into();
        let has_copylist = r.read_bool("has_copylist")?;
        let copylist = r.read_sequence("copylist")?;
        let activity = match r.read_value("activity")? {
            0 => MasterActivity::Idle,
            1 => MasterActivity::Writing,
            2 => MasterActivity::Invalidating,
            3 => MasterActivity::WritingAndInvalidating,
            _ => return Err(Error::Checkpoint("unknown master activity".into())),
        };
        let master_data = MasterData {
            activity,
            copy_waitlist: r.read_sequence::<NodeId>("copy_waitlist")?.into(),
            pending_copies: r.read_u32("pending_copies")?,
            pending_invalidations: r.read_u32("pending_invalidations")?,
            tasks_waiting_for_invalidation: r.read_sequence("tasks_waiting_for_invalidation")?,
        };
        let owner_data = OwnerData {
            master: target_from(r.read_value("master")?)?,
            target: Target::load(r)?,
            master_waitlist: r.read_sequence::<Target>("master_waitlist")?.into(),
            copy_waitlist: r.read_sequence::<NodeId>("owner_copy_waitlist")?.into(),
        };
        Ok(Self {
            id,
            me,
            owner,
            len,
            allocator,
            flags,
            buffer,
            destroyed,
            state,
            locks,
            waitlist,
            has_copylist,
            copylist,
            master_data,
            owner_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Snapshot;

    #[test]
    fn test_checkpoint_keeps_contents_and_protocol_state() {
        let id = GlobalId::direct(0, 5);
        let mut block = DataBlock::with_data(id, 0, 0, vec![1, 2, 3], 4, 9);
        block.copylist = vec![1, 2];
        block.waitlist.push_back((GlobalId::direct(1, 8), AccessMode::Ew));
        block.owner_data.master_waitlist.push_back(Target::Destroy);

        let mut snapshot = Snapshot::new(0, 3);
        block.save(&mut snapshot);
        let loaded = DataBlock::load(&mut snapshot.reader()).unwrap();
        assert_eq!(loaded.buffer().map(Buffer::to_vec), Some(vec![1, 2, 3]));
        assert_eq!(loaded.copylist, vec![1, 2]);
        assert_eq!(loaded.flags(), 4);
        assert_eq!(loaded.allocator(), 9);
        assert_eq!(loaded.waiting().next(), Some(&(GlobalId::direct(1, 8), AccessMode::Ew)));
        assert_eq!(loaded.owner_data.master, Some(Target::Node(0)));
        assert_eq!(loaded.owner_data.master_waitlist.front(), Some(&Target::Destroy));
    }

    #[test]
    fn test_checkpoint_of_invalid_replica_has_no_buffer() {
        let block = DataBlock::invalid(GlobalId::direct(1, 5), 0, 1, 64, 0, 1);
        let mut snapshot = Snapshot::new(0, 2);
        block.save(&mut snapshot);
        let loaded = DataBlock::load(&mut snapshot.reader()).unwrap();
        assert!(loaded.buffer().is_none());
        assert_eq!(loaded.len(), 64);
        assert_eq!(loaded.state(), ReplicaState::Invalid);
    }
}
