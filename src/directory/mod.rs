//! Object identity and lookup: the per-node repository of owned objects and
//! the cache of objects owned elsewhere.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::{
    block::DataBlock,
    checkpoint::{Checkpoint, Reader, Writer},
    error::Error,
    graph::{event::Event, task::Task, template::TaskTemplate},
    id::GlobalId,
};

mod cache;
mod repository;

pub use cache::{Cache, Lookup};
pub use repository::Repository;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Template = 1,
    Block = 2,
    Task = 3,
    Event = 4,
}

impl TryFrom<u8> for ObjectKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ObjectKind::Template),
            2 => Ok(ObjectKind::Block),
            3 => Ok(ObjectKind::Task),
            4 => Ok(ObjectKind::Event),
            _ => Err(Error::MalformedMessage("unknown object kind")),
        }
    }
}

/// Anything an id can name on a node. Remote tasks and events are only
/// known by kind.
#[derive(Clone)]
pub enum Object {
    Template(Arc<TaskTemplate>),
    Block(Arc<Mutex<DataBlock>>),
    Task(Arc<Mutex<Task>>),
    Event(Arc<Mutex<Event>>),
    Proxy(ObjectKind),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Template(_) => ObjectKind::Template,
            Object::Block(_) => ObjectKind::Block,
            Object::Task(_) => ObjectKind::Task,
            Object::Event(_) => ObjectKind::Event,
            Object::Proxy(kind) => *kind,
        }
    }

    pub fn block(
        self,
        id: GlobalId,
    ) -> Result<Arc<Mutex<DataBlock>>, Error> {
        match self {
            Object::Block(block) => Ok(block),
            _ => Err(Error::WrongObjectKind { id, expected: ObjectKind::Block }),
        }
    }

    pub fn task(self, id: GlobalId) -> Result<Arc<Mutex<Task>>, Error> {
        match self {
            Object::Task(task) => Ok(task),
            _ => Err(Error::WrongObjectKind { id, expected: ObjectKind::Task }),
        }
    }

    pub fn event(self, id: GlobalId) -> Result<Arc<Mutex<Event>>, Error> {
        match self {
            Object::Event(event) => Ok(event),
            _ => Err(Error::WrongObjectKind { id, expected: ObjectKind::Event }),
        }
    }

    pub fn template(self, id: GlobalId) -> Result<Arc<TaskTemplate>, Error> {
        match self {
            Object::Template(template) => Ok(template),
            _ => Err(Error::WrongObjectKind {
                id,
                expected: ObjectKind::Template,
            }),
        }
    }
}

impl Checkpoint for Object {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("proxy", matches!(self, Object::Proxy(_)) as u64);
        w.write_value("kind", self.kind() as u64);
        match self {
            Object::Template(template) => template.save(w),
            Object::Block(block) => lock(block).save(w),
            Object::Task(task) => lock(task).save(w),
            Object::Event(event) => lock(event).save(w),
            Object::Proxy(_) => {}
        }
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        let proxy = r.read_bool("proxy")?;
        let kind = ObjectKind::try_from(r.read_value("kind")? as u8)?;
        if proxy {
            return Ok(Object::Proxy(kind));
        }
        Ok(match kind {
            ObjectKind::Template => Object::Template(Arc::new(TaskTemplate::load(r)?)),
            ObjectKind::Block => Object::Block(Arc::new(Mutex::new(DataBlock::load(r)?))),
            ObjectKind::Task => Object::Task(Arc::new(Mutex::new(Task::load(r)?))),
            ObjectKind::Event => Object::Event(Arc::new(Mutex::new(Event::load(r)?))),
        })
    }
}

/// Poison is ignored: task bodies never run with an object lock held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
