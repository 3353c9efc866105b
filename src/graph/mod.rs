//! The dependency graph: tasks, events and the slots that connect them.

use std::sync::{Arc, Mutex};

use crate::{
    block::{AccessMode, Buffer},
    checkpoint::{Checkpoint, Reader, Writer},
    directory::{lock, Object, ObjectKind},
    error::Error,
    id::GlobalId,
};

pub mod event;
pub mod task;
pub mod template;

use event::{Event, Fire};
use task::Task;

/// Creation property bits shared by tasks, events and blocks.
pub mod properties {
    /// The task's output event is a latch that fires only after every task
    /// created inside the task's scope has finished.
    pub const FINISH: u16 = 1;
    /// The id was chosen by the caller from a labeled range.
    pub const LABELED: u16 = 2;
    /// Concurrent creation of the same labeled id is tolerated.
    pub const CHECK: u16 = 4;
    /// The event carries a data id to its post-slots.
    pub const TAKES_ARG: u16 = 8;
    /// The creating task does not acquire the new block.
    pub const NO_ACQUIRE: u16 = 16;
}

/// Template counts taken from the template.
pub const PARAM_DEF: u32 = u32::MAX;

/// Latch slot that counts down.
pub const LATCH_DECR_SLOT: u32 = 0;
/// Latch slot that counts up.
pub const LATCH_INCR_SLOT: u32 = 1;

/// An incoming dependency edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preslot {
    pub satisfied: bool,
    pub data: GlobalId,
    pub mode: AccessMode,
}

impl Default for Preslot {
    fn default() -> Self {
        Self { satisfied: false, data: GlobalId::NULL, mode: AccessMode::DEFAULT }
    }
}

/// An outgoing dependency edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Postslot {
    pub destination: GlobalId,
    pub slot: u32,
}

impl Checkpoint for Preslot {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("satisfied", self.satisfied as u64);
        self.data.save(w);
        self.mode.save(w);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            satisfied: r.read_bool("satisfied")?,
            data: GlobalId::load(r)?,
            mode: AccessMode::load(r)?,
        })
    }
}

impl Checkpoint for Postslot {
    fn save<W: Writer>(&self, w: &mut W) {
        self.destination.save(w);
        w.write_value("slot", u64::from(self.slot));
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self { destination: GlobalId::load(r)?, slot: r.read_u32("slot")? })
    }
}

/// A satisfaction to deliver once the vertex lock is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    pub destination: GlobalId,
    pub slot: u32,
    pub data: GlobalId,
}

impl Postslot {
    pub fn signal(self, data: GlobalId) -> Signal {
        Signal { destination: self.destination, slot: self.slot, data }
    }
}

/// What a task body sees for each of its dependency slots.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub guid: GlobalId,
    pub mode: AccessMode,
    /// Block contents, for slots that acquired a block.
    pub buffer: Option<Buffer>,
}

/// How a vertex reacted to an edge or satisfaction.
#[derive(Debug, Default)]
pub enum Reaction {
    #[default]
    Pending,
    /// An event fired or forwarded data.
    Event(Fire),
    /// Every pre-slot of a task is satisfied; start acquiring its blocks.
    Runnable,
}

/// A graph node owned by this node.
#[derive(Clone)]
pub enum Vertex {
    Task(Arc<Mutex<Task>>),
    Event(Arc<Mutex<Event>>),
}

impl Vertex {
    pub fn from_object(id: GlobalId, object: Object) -> Result<Self, Error> {
        match object {
            Object::Task(task) => Ok(Vertex::Task(task)),
            Object::Event(event) => Ok(Vertex::Event(event)),
            _ => Err(Error::WrongObjectKind { id, expected: ObjectKind::Task }),
        }
    }

    pub fn add_preslot(
        &self,
        source: GlobalId,
        mode: AccessMode,
        slot: u32,
    ) -> Result<Reaction, Error> {
        match self {
            Vertex::Task(task) => Ok(runnable(lock(task).add_preslot(source, mode, slot)?)),
            Vertex::Event(event) => {
                Ok(Reaction::Event(lock(event).add_preslot(source, mode, slot)?))
            }
        }
    }

    pub fn satisfy(&self, slot: u32, data: GlobalId) -> Result<Reaction, Error> {
        match self {
            Vertex::Task(task) => Ok(runnable(lock(task).satisfy(slot, data)?)),
            Vertex::Event(event) => Ok(Reaction::Event(lock(event).satisfy(slot, data)?)),
        }
    }

    pub fn add_postslot(&self, postslot: Postslot) -> Result<Vec<Signal>, Error> {
        match self {
            Vertex::Task(task) => Ok(lock(task).add_postslot(postslot).into_iter().collect()),
            Vertex::Event(event) => Ok(lock(event).add_postslot(postslot)?.signals),
        }
    }
}

fn runnable(all_satisfied: bool) -> Reaction {
    if all_satisfied {
        Reaction::Runnable
    } else {
        Reaction::Pending
    }
}
