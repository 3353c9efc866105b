use hashbrown::HashMap;

use super::{Dependency, Postslot, Preslot, Signal};
use crate::{
    block::{combine, AccessMode, Buffer},
    checkpoint::{Checkpoint, Reader, Writer},
    error::Error,
    id::GlobalId,
};

/// Lifecycle of a task. Always moves forward.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Created = 0,
    Acquired = 1,
    ReadyToSpawn = 2,
    Spawning = 3,
    Running = 4,
    Done = 5,
}

impl TryFrom<u8> for TaskState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskState::Created),
            1 => Ok(TaskState::Acquired),
            2 => Ok(TaskState::ReadyToSpawn),
            3 => Ok(TaskState::Spawning),
            4 => Ok(TaskState::Running),
            5 => Ok(TaskState::Done),
            _ => Err(Error::MalformedMessage("unknown task state")),
        }
    }
}

/// An event-driven task: runs once every pre-slot is satisfied and every
/// block it names is locked in the requested mode.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: GlobalId,
    pub(crate) template: GlobalId,
    pub(crate) function: u32,
    pub(crate) name: String,
    pub(crate) params: Vec<u64>,
    pub(crate) preslots: Vec<Preslot>,
    pub(crate) postslots: Vec<Postslot>,
    pub(crate) state: TaskState,
    pub(crate) ready_to_start: bool,
    pub(crate) all_satisfied: bool,
    /// Blocks to lock, sorted by id, with combined modes. Entries released
    /// early are nulled out rather than removed.
    pub(crate) blocks: Vec<(GlobalId, AccessMode)>,
    pub(crate) buffers: HashMap<GlobalId, Buffer>,
    /// Index of the next block to acquire; while running, the number of
    /// outstanding releases plus one.
    pub(crate) acquired: usize,
    pub(crate) result: GlobalId,
    pub(crate) output: GlobalId,
    /// Latch of the innermost enclosing finish scope.
    pub(crate) finish_scope: GlobalId,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GlobalId,
        template: GlobalId,
        function: u32,
        name: String,
        params: Vec<u64>,
        depc: u32,
        output: GlobalId,
        finish_scope: GlobalId,
    ) -> Self {
        Self {
            id,
            template,
            function,
            name,
            params,
            preslots: vec![Preslot::default(); depc as usize],
            postslots: Vec::new(),
            state: TaskState::Created,
            ready_to_start: false,
            all_satisfied: depc == 0,
            blocks: Vec::new(),
            buffers: HashMap::new(),
            acquired: 0,
            result: GlobalId::NULL,
            output,
            finish_scope,
        }
    }

    pub fn id(&self) -> GlobalId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> u32 {
        self.function
    }

    pub fn output(&self) -> GlobalId {
        self.output
    }

    pub fn finish_scope(&self) -> GlobalId {
        self.finish_scope
    }

    fn slot(&mut self, slot: u32) -> Result<&mut Preslot, Error> {
        let id = self.id;
        self.preslots
            .get_mut(slot as usize)
            .ok_or(Error::SlotOutOfRange { id, slot })
    }

    /// Records an incoming edge. Returns true when this made the task
    /// runnable.
    pub fn add_preslot(
        &mut self,
        source: GlobalId,
        mode: AccessMode,
        slot: u32,
    ) -> Result<bool, Error> {
        let preslot = self.slot(slot)?;
        preslot.data = source;
        preslot.mode = mode;
        if !source.is_null() {
            return Ok(false);
        }
        preslot.satisfied = true;
        Ok(self.check_all_satisfied())
    }

    /// Satisfies a pre-slot. Returns true when this made the task runnable.
    /// A slot is satisfied at most once.
    pub fn satisfy(&mut self, slot: u32, data: GlobalId) -> Result<bool, Error> {
        let id = self.id;
        let preslot = self.slot(slot)?;
        if preslot.satisfied {
            return Err(Error::AlreadySatisfied { id, slot });
        }
        preslot.data = data;
        preslot.satisfied = true;
        Ok(self.check_all_satisfied())
    }

    fn check_all_satisfied(&mut self) -> bool {
        if self.all_satisfied || !self.preslots.iter().all(|p| p.satisfied) {
            return false;
        }
        self.all_satisfied = true;
        self.order_blocks();
        self.acquired = 0;
        true
    }

    /// Collects every block a non-null mode refers to, once, sorted by id,
    /// with the modes of duplicate references combined.
    fn order_blocks(&mut self) {
        let mut blocks: Vec<(GlobalId, AccessMode)> = Vec::new();
        for preslot in &self.preslots {
            if preslot.data.is_null() || preslot.mode == AccessMode::Null {
                continue;
            }
            match blocks.iter_mut().find(|(id, _)| *id == preslot.data) {
                Some((_, mode)) => *mode = combine(*mode, preslot.mode),
                None => blocks.push((preslot.data, preslot.mode)),
            }
        }
        blocks.sort_by_key(|(id, _)| *id);
        self.blocks = blocks;
    }

    /// The block to acquire next, if any remain.
    pub fn next_block(&self) -> Option<(GlobalId, AccessMode)> {
        self.blocks.get(self.acquired).copied()
    }

    pub fn block_acquired(
        &mut self,
        block: GlobalId,
        buffer: Option<Buffer>,
    ) -> Result<(), Error> {
        match self.next_block() {
            Some((expected, _)) if expected == block => {}
            _ => {
                return Err(Error::ProtocolViolation {
                    id: block,
                    what: "lock granted to a task not waiting for it",
                })
            }
        }
        if let Some(buffer) = buffer {
            self.buffers.insert(block, buffer);
        }
        self.acquired += 1;
        Ok(())
    }

    /// Every block is locked. Returns true if the task should be handed to
    /// the worker pool now.
    pub fn all_acquired(&mut self) -> bool {
        self.state = TaskState::Acquired;
        self.spawn()
    }

    fn spawn(&mut self) -> bool {
        self.state = TaskState::ReadyToSpawn;
        if !self.ready_to_start {
            return false;
        }
        self.state = TaskState::Spawning;
        true
    }

    /// The create handler is done with the task. Returns true if the task
    /// should be handed to the worker pool now.
    pub fn make_ready(&mut self) -> bool {
        self.ready_to_start = true;
        self.state == TaskState::ReadyToSpawn && self.spawn()
    }

    /// Moves the task to Running and builds what the body receives.
    pub fn start(&mut self) -> (Vec<u64>, Vec<Dependency>) {
        let deps = self
            .preslots
            .iter()
            .map(|preslot| {
                let mode = self
                    .blocks
                    .iter()
                    .find(|(id, _)| *id == preslot.data)
                    .map(|(_, mode)| *mode)
                    .unwrap_or(AccessMode::Null);
                let buffer = match mode {
                    AccessMode::Null => None,
                    _ => self.buffers.get(&preslot.data).cloned(),
                };
                Dependency { guid: preslot.data, mode: preslot.mode, buffer }
            })
            .collect();
        self.acquired = self.blocks.len() + 1;
        self.state = TaskState::Running;
        (self.params.clone(), deps)
    }

    /// The body returned. Returns true when nothing is left to wait for.
    pub fn finished(&mut self, result: GlobalId) -> bool {
        self.state = TaskState::Done;
        self.result = result;
        self.buffers.clear();
        self.release_one()
    }

    /// One held block no longer needs waiting for. Returns true when that
    /// was the last one.
    pub fn release_one(&mut self) -> bool {
        self.acquired = self.acquired.saturating_sub(1);
        self.acquired == 0
    }

    /// Blocks still held, in lock order.
    pub fn held_blocks(&self) -> Vec<(GlobalId, AccessMode)> {
        self.blocks.iter().copied().filter(|(id, _)| !id.is_null()).collect()
    }

    /// Adopts a block the running task created; it is locked for writing.
    pub fn add_block(&mut self, block: GlobalId, buffer: Option<Buffer>) {
        self.blocks.push((block, AccessMode::DEFAULT));
        if let Some(buffer) = buffer {
            self.buffers.insert(block, buffer);
        }
        self.acquired += 1;
    }

    pub fn owns_block(&self, block: GlobalId) -> bool {
        !block.is_null() && self.blocks.iter().any(|(id, _)| *id == block)
    }

    pub fn block_buffer(&self, block: GlobalId) -> Option<Buffer> {
        self.buffers.get(&block).cloned()
    }

    /// Forgets a block released before the task ends and returns the mode
    /// it was held in.
    pub fn forget_block(&mut self, block: GlobalId) -> Result<AccessMode, Error> {
        let entry = self
            .blocks
            .iter_mut()
            .find(|(id, _)| !block.is_null() && *id == block)
            .ok_or(Error::LockNotHeld(block))?;
        entry.0 = GlobalId::NULL;
        self.buffers.remove(&block);
        Ok(entry.1)
    }

    pub fn add_postslot(&mut self, postslot: Postslot) -> Option<Signal> {
        self.postslots.push(postslot);
        (self.state == TaskState::Done && self.acquired == 0)
            .then(|| postslot.signal(self.result))
    }

    /// Satisfactions sent once every lock is released.
    pub fn notifications(&self) -> Vec<Signal> {
        self.postslots.iter().map(|p| p.signal(self.result)).collect()
    }

    /// Blocks locked for the task whose buffer handles it keeps until it
    /// runs.
    pub(crate) fn locked_blocks(&self) -> Vec<GlobalId> {
        if self.state >= TaskState::Running {
            return Vec::new();
        }
        self.blocks[..self.acquired.min(self.blocks.len())]
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !id.is_null())
            .collect()
    }
}

impl Checkpoint for Task {
    fn save<W: Writer>(&self, w: &mut W) {
        self.id.save(w);
        self.template.save(w);
        w.write_value("function", u64::from(self.function));
        w.write_bytes("name", self.name.as_bytes());
        w.write_sequence("params", &self.params);
        w.write_sequence("preslots", &self.preslots);
        w.write_sequence("postslots", &self.postslots);
        w.write_value("state", self.state as u64);
        w.write_value("ready_to_start", self.ready_to_start as u64);
        w.write_value("all_satisfied", self.all_satisfied as u64);
        w.write_sequence("blocks", &self.blocks);
        w.write_value("acquired", self.acquired as u64);
        self.result.save(w);
        self.output.save(w);
        self.finish_scope.save(w);
    }

    /// Buffer handles are not part of a checkpoint; the loader hands them
    /// back for [`Task::locked_blocks`].
    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            id: GlobalId::load(r)?,
            template: GlobalId::load(r)?,
            function: r.read_u32("function")?,
            name: String::from_utf8(r.read_bytes("name")?)
                .map_err(|_| Error::Checkpoint("task name is not utf-8".into()))?,
            params: r.read_sequence("params")?,
            preslots: r.read_sequence("preslots")?,
            postslots: r.read_sequence("postslots")?,
            state: TaskState::try_from(r.read_value("state")? as u8)?,
            ready_to_start: r.read_bool("ready_to_start")?,
            all_satisfied: r.read_bool("all_satisfied")?,
            blocks: r.read_sequence("blocks")?,
            buffers: HashMap::new(),
            acquired: r.read_value("acquired")? as usize,
            result: GlobalId::load(r)?,
            output: GlobalId::load(r)?,
            finish_scope: GlobalId::load(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AccessMode::*;

    fn task(depc: u32) -> Task {
        Task::new(
            GlobalId::direct(0, 10),
            GlobalId::direct(0, 2),
            0,
            "t".into(),
            vec![1, 2],
            depc,
            GlobalId::direct(0, 11),
            GlobalId::NULL,
        )
    }

    fn db(n: u32) -> GlobalId {
        GlobalId::direct(1, n)
    }

    #[test]
    fn test_runnable_only_after_every_slot() {
        let mut t = task(3);
        assert!(!t.add_preslot(db(5), Rw, 0).unwrap());
        assert!(!t.satisfy(2, db(6)).unwrap());
        assert!(!t.add_preslot(GlobalId::NULL, Null, 1).unwrap());
        assert!(t.satisfy(0, db(5)).unwrap());
        assert!(matches!(t.satisfy(3, db(5)), Err(Error::SlotOutOfRange { slot: 3, .. })));
    }

    #[test]
    fn test_second_satisfy_of_a_slot_is_rejected() {
        let mut t = task(2);
        t.add_preslot(db(5), Rw, 0).unwrap();
        assert!(!t.satisfy(0, db(5)).unwrap());
        assert!(matches!(
            t.satisfy(0, db(6)),
            Err(Error::AlreadySatisfied { slot: 0, .. })
        ));
        // a null edge satisfies its slot on arrival
        t.add_preslot(GlobalId::NULL, Null, 1).unwrap();
        assert!(matches!(
            t.satisfy(1, db(7)),
            Err(Error::AlreadySatisfied { slot: 1, .. })
        ));
        // the first block is still the one the task acquires
        assert!(!t.all_satisfied);
        assert_eq!(t.preslots[0].data, db(5));
    }

    #[test]
    fn test_blocks_are_sorted_deduplicated_and_combined() {
        let mut t = task(4);
        t.add_preslot(db(9), Const, 0).unwrap();
        t.add_preslot(db(3), Ro, 1).unwrap();
        t.add_preslot(db(9), Rw, 2).unwrap();
        t.add_preslot(db(7), Null, 3).unwrap();
        for (slot, id) in [(0, 9), (1, 3), (2, 9), (3, 7)] {
            t.satisfy(slot, db(id)).unwrap();
        }
        assert_eq!(t.blocks, vec![(db(3), Ro), (db(9), Ew)]);
        assert_eq!(t.next_block(), Some((db(3), Ro)));
    }

    #[test]
    fn test_spawn_waits_for_make_ready() {
        let mut t = task(1);
        assert!(t.satisfy(0, db(1)).unwrap());
        let buffer = Buffer::zeroed(4);
        t.block_acquired(db(1), Some(buffer.clone())).unwrap();
        assert_eq!(t.next_block(), None);
        assert!(!t.all_acquired());
        assert_eq!(t.state(), TaskState::ReadyToSpawn);
        assert!(t.make_ready());
        assert_eq!(t.state(), TaskState::Spawning);

        let (params, deps) = t.start();
        assert_eq!(params, vec![1, 2]);
        assert_eq!(deps[0].guid, db(1));
        assert!(deps[0].buffer.as_ref().unwrap().same(&buffer));
        assert_eq!(t.state(), TaskState::Running);
        assert!(!t.finished(GlobalId::NULL));
        assert!(t.release_one());
    }

    #[test]
    fn test_grant_for_wrong_block_is_rejected() {
        let mut t = task(1);
        t.satisfy(0, db(1)).unwrap();
        assert!(t.block_acquired(db(2), None).is_err());
    }

    #[test]
    fn test_null_mode_slot_gets_no_buffer() {
        let mut t = task(1);
        t.add_preslot(db(4), Null, 0).unwrap();
        assert!(t.satisfy(0, db(4)).unwrap());
        assert!(t.blocks.is_empty());
        assert!(!t.all_acquired());
        t.make_ready();
        let (_, deps) = t.start();
        assert_eq!(deps[0].guid, db(4));
        assert!(deps[0].buffer.is_none());
        assert!(t.finished(db(4)));
        assert_eq!(t.notifications(), Vec::new());
    }

    #[test]
    fn test_created_and_released_blocks() {
        let mut t = task(0);
        t.make_ready();
        t.start();
        t.add_block(db(8), Some(Buffer::zeroed(2)));
        assert!(t.owns_block(db(8)));
        assert_eq!(t.forget_block(db(8)).unwrap(), Rw);
        assert!(!t.owns_block(db(8)));
        assert!(t.held_blocks().is_empty());
        assert!(matches!(t.forget_block(db(8)), Err(Error::LockNotHeld(_))));
    }
}
