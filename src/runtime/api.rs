//! What task bodies and launching code can do.
//!
//! A [`Scope`] runs on a blocking thread, either as a task body or as the
//! code a cluster was started with. Everything it sends leaves under one
//! sending id, so the messages of one scope arrive in the order they were
//! issued.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tracing::{debug, trace};

use super::context::{Context, Outbox};
use crate::{
    block::{AccessMode, Buffer, DataBlock},
    directory::{lock, Object},
    error::Error,
    graph::{
        event::{Event, EventKind},
        properties,
        task::Task,
        template::TaskTemplate,
        LATCH_INCR_SLOT, PARAM_DEF,
    },
    id::{GlobalId, NodeId},
    net::{wire::EdtCreate, Command, Message},
};

pub struct Scope<'a> {
    ctx: &'a Arc<Context>,
    sender: GlobalId,
    task: Option<Arc<Mutex<Task>>>,
    /// Latch the tasks created here report to.
    finish_scope: GlobalId,
}

impl<'a> Scope<'a> {
    pub(crate) fn launcher(ctx: &'a Arc<Context>, sender: GlobalId) -> Self {
        Self { ctx, sender, task: None, finish_scope: GlobalId::NULL }
    }

    pub(crate) fn task(
        ctx: &'a Arc<Context>,
        id: GlobalId,
        task: Arc<Mutex<Task>>,
        finish_scope: GlobalId,
    ) -> Self {
        Self { ctx, sender: id, task: Some(task), finish_scope }
    }

    /// The node this scope runs on.
    pub fn node(&self) -> NodeId {
        self.ctx.me
    }

    pub fn node_count(&self) -> u32 {
        self.ctx.node_count
    }

    /// The running task, or `None` for launching code.
    pub fn current_task(&self) -> Option<GlobalId> {
        self.task.as_ref().map(|_| self.sender)
    }

    fn outbox(&self) -> Outbox<'a> {
        Outbox::task(self.ctx, self.sender)
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        self.outbox().send(msg)
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.ctx.runtime.block_on(future)
    }

    fn running_task(&self) -> Result<&Arc<Mutex<Task>>, Error> {
        self.task.as_ref().ok_or(Error::NotInTask)
    }

    /// The node an affinity hint names, or the configured policy's pick.
    fn place(&self, affinity: GlobalId) -> NodeId {
        if affinity.is_null() {
            let ctx = self.ctx;
            ctx.config.affinity.pick(ctx.me, ctx.node_count, &ctx.affinity_cursor)
        } else {
            self.ctx.owner(affinity)
        }
    }

    /// Describes tasks running the body registered as `name`. Counts may be
    /// `PARAM_DEF` to leave them to each creation.
    pub fn template_create(&mut self, name: &str, paramc: u32, depc: u32) -> Result<GlobalId, Error> {
        let function = self.ctx.registry.index(name)?;
        let id = self.ctx.repository.preallocate_object();
        let template = TaskTemplate { id, function, paramc, depc, name: name.to_owned() };
        let mut out = self.outbox();
        for node in (0..self.ctx.node_count).filter(|&node| node != self.ctx.me) {
            out.send(Message::push_edt_template(node, &template))?;
        }
        self.ctx.repository.set_object(id, Object::Template(Arc::new(template)))?;
        debug!(template = %id, name, "template created");
        Ok(id)
    }

    /// Checks the counts against the template and resolves defaults.
    fn counts(&self, template: GlobalId, params: &[u64], depc: u32, deps: Option<&[GlobalId]>) -> Result<u32, Error> {
        let template = self.block_on(self.ctx.resolve(template))?.template(template)?;
        if template.paramc != PARAM_DEF && params.len() as u32 != template.paramc {
            return Err(Error::InvalidArgument("parameter count differs from the template"));
        }
        let (_, depc) = template.counts(0, depc);
        if depc == PARAM_DEF {
            return Err(Error::InvalidArgument("dependence count left to a template without one"));
        }
        if template.depc != PARAM_DEF && depc != template.depc {
            return Err(Error::InvalidArgument("dependence count differs from the template"));
        }
        if deps.map_or(false, |deps| deps.len() as u32 != depc) {
            return Err(Error::InvalidArgument("dependence list length differs from the count"));
        }
        Ok(depc)
    }

    /// Creates a task and its output event. Dependencies listed here are
    /// wired on creation; `GlobalId::UNINITIALIZED` leaves a slot for
    /// `add_dependence`.
    pub fn task_create(
        &mut self,
        template: GlobalId,
        params: &[u64],
        depc: u32,
        deps: Option<&[GlobalId]>,
        properties: u16,
        affinity: GlobalId,
    ) -> Result<(GlobalId, GlobalId), Error> {
        let node = self.place(affinity);
        let task = self.block_on(self.ctx.reserve_id(node))?;
        self.create(template, params, depc, deps, properties, node, task)
    }

    /// Creates a task under a labeled id; its owner runs it.
    #[allow(clippy::too_many_arguments)]
    pub fn labeled_task_create(
        &mut self,
        id: GlobalId,
        template: GlobalId,
        params: &[u64],
        depc: u32,
        deps: Option<&[GlobalId]>,
        properties: u16,
    ) -> Result<GlobalId, Error> {
        if !id.is_mapped() {
            return Err(Error::InvalidArgument("labeled creation needs an id from a range"));
        }
        let node = self.ctx.owner(id);
        let (_, event) = self.create(template, params, depc, deps, properties | properties::LABELED, node, id)?;
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        template: GlobalId,
        params: &[u64],
        depc: u32,
        deps: Option<&[GlobalId]>,
        properties: u16,
        node: NodeId,
        task: GlobalId,
    ) -> Result<(GlobalId, GlobalId), Error> {
        let depc = self.counts(template, params, depc, deps)?;
        let event = self.block_on(self.ctx.reserve_id(node))?;
        let mut out = self.outbox();
        if !self.finish_scope.is_null() {
            let scope = self.finish_scope;
            out.send(Message::satisfy_preslot(self.ctx.owner(scope), GlobalId::NULL, scope, LATCH_INCR_SLOT))?;
        }
        let create = EdtCreate {
            template,
            params: params.to_vec(),
            depc,
            deps: deps.map(<[GlobalId]>::to_vec),
            properties,
            affinity: GlobalId::node_hint(node),
            task,
            event,
            parent_finish: self.finish_scope,
        };
        out.send(Message::edt_create(node, &create))?;
        trace!(%task, %event, node, depc, "task create sent");
        Ok((task, event))
    }

    /// Makes `source` satisfy `slot` of `destination`. A block source
    /// satisfies it right away; a task or event once it fires.
    pub fn add_dependence(
        &mut self,
        source: GlobalId,
        destination: GlobalId,
        slot: u32,
        mode: AccessMode,
    ) -> Result<(), Error> {
        self.send(Message::add_preslot(self.ctx.owner(destination), source, destination, slot, mode))
    }

    /// Satisfies `slot` of `destination` with a copy of a block this task
    /// holds. The copy is a new block owned by the destination's node.
    pub fn add_dependence_by_value(
        &mut self,
        source: GlobalId,
        destination: GlobalId,
        slot: u32,
        mode: AccessMode,
    ) -> Result<(), Error> {
        let buffer = lock(self.running_task()?)
            .block_buffer(source)
            .ok_or(Error::LockNotHeld(source))?;
        let data = buffer.to_vec();
        self.send(Message::satisfy_preslot_with_data(self.ctx.owner(destination), destination, slot, mode, data))
    }

    /// Creates a zero filled block. A running task holds it for writing
    /// unless `NO_ACQUIRE` is given; launching code gets the buffer of the
    /// new master directly.
    pub fn db_create(
        &mut self,
        len: u64,
        flags: u16,
        affinity: GlobalId,
    ) -> Result<(GlobalId, Option<Buffer>), Error> {
        let me = self.ctx.me;
        let node = if affinity.is_null() { me } else { self.ctx.owner(affinity) };
        let acquire = self.task.is_some() && flags & properties::NO_ACQUIRE == 0;
        if node != me && !acquire {
            let id = self.block_on(self.ctx.reserve_id(node))?;
            self.send(Message::db_create(node, id, len, flags, 0))?;
            return Ok((id, None));
        }
        let id = self.ctx.repository.preallocate_object();
        let block = Arc::new(Mutex::new(DataBlock::new(id, me, me, len, flags, 0)));
        self.ctx.repository.set_object(id, Object::Block(block.clone()))?;
        let buffer = self.adopt_block(id, &block, acquire)?;
        Ok((id, buffer))
    }

    /// Creates a block under a labeled id. With `CHECK` in `flags` an
    /// existing block of that id is tolerated and `None` returned.
    pub fn labeled_db_create(&mut self, id: GlobalId, len: u64, flags: u16) -> Result<Option<Buffer>, Error> {
        if !id.is_mapped() {
            return Err(Error::InvalidArgument("labeled creation needs an id from a range"));
        }
        let me = self.ctx.me;
        let owner = self.ctx.owner(id);
        let acquire = self.task.is_some() && flags & properties::NO_ACQUIRE == 0;
        let block = Arc::new(Mutex::new(DataBlock::new(id, me, owner, len, flags, 0)));
        if owner == me {
            if !self.ctx.repository.add_mapped_object(id, Object::Block(block.clone())) {
                if flags & properties::CHECK != 0 {
                    return Ok(None);
                }
                return Err(Error::AlreadyExists(id));
            }
        } else {
            if !self.ctx.cache.insert(id, Object::Block(block.clone())) {
                return Err(Error::AlreadyExists(id));
            }
            self.send(Message::mapped_db_create(owner, id, len, flags, 0, me))?;
        }
        self.adopt_block(id, &block, acquire)
    }

    /// Locks a block this scope just created for the running task.
    fn adopt_block(
        &self,
        id: GlobalId,
        block: &Arc<Mutex<DataBlock>>,
        acquire: bool,
    ) -> Result<Option<Buffer>, Error> {
        let Some(task) = &self.task else {
            return Ok(lock(block).buffer().cloned());
        };
        if !acquire {
            return Ok(None);
        }
        let mut fx = Vec::new();
        let (granted, buffer) = {
            let mut block = lock(block);
            let granted = block.try_lock(self.sender, AccessMode::DEFAULT, &mut fx);
            (granted, block.buffer().cloned())
        };
        self.ctx.drive_block(id, fx)?;
        if !granted {
            return Err(Error::ProtocolViolation { id, what: "new block not available to its creator" });
        }
        lock(task).add_block(id, buffer.clone());
        Ok(buffer)
    }

    /// Gives up the running task's lock on `id` before the task ends.
    pub fn db_release(&mut self, id: GlobalId) -> Result<(), Error> {
        let task = self.running_task()?;
        let mode = lock(task).forget_block(id)?;
        let block = self.ctx.object(id)?.block(id)?;
        let visible = if mode.writes() {
            let mut fx = Vec::new();
            let visible = lock(&block).writer_finished(self.sender, &mut fx);
            self.ctx.drive_block(id, fx)?;
            visible
        } else {
            true
        };
        if visible {
            lock(task).release_one();
        }
        let mut fx = Vec::new();
        lock(&block).unlock(mode, &mut fx)?;
        self.ctx.drive_block(id, fx)?;
        trace!(block = %id, ?mode, "released early");
        Ok(())
    }

    /// Destroys a block, releasing it first if this task holds it.
    pub fn db_destroy(&mut self, id: GlobalId) -> Result<(), Error> {
        let held = self.task.as_ref().map_or(false, |task| lock(task).owns_block(id));
        if held {
            self.db_release(id)?;
        }
        if self.ctx.is_local(id) {
            let block = self.ctx.object(id)?.block(id)?;
            let mut fx = Vec::new();
            lock(&block).destroy(&mut fx)?;
            return self.ctx.drive_block(id, fx);
        }
        self.send(Message::db_destroy(self.ctx.owner(id), id))
    }

    pub fn event_create(&mut self, kind: EventKind, takes_arg: bool) -> Result<GlobalId, Error> {
        if kind == EventKind::Latch {
            return self.event_create_latch(0);
        }
        let id = self.ctx.repository.preallocate_object();
        let event = Event::new(id, kind, takes_arg, 0);
        self.ctx.repository.set_object(id, Object::Event(Arc::new(Mutex::new(event))))?;
        Ok(id)
    }

    /// A latch that fires once `initial` decrements outnumber increments.
    pub fn event_create_latch(&mut self, initial: u64) -> Result<GlobalId, Error> {
        let id = self.ctx.repository.preallocate_object();
        let event = Event::new(id, EventKind::Latch, false, initial);
        self.ctx.repository.set_object(id, Object::Event(Arc::new(Mutex::new(event))))?;
        Ok(id)
    }

    pub fn event_satisfy(&mut self, event: GlobalId, data: GlobalId) -> Result<(), Error> {
        self.event_satisfy_slot(event, data, 0)
    }

    pub fn event_satisfy_slot(&mut self, event: GlobalId, data: GlobalId, slot: u32) -> Result<(), Error> {
        self.send(Message::satisfy_preslot(self.ctx.owner(event), data, event, slot))
    }

    pub fn event_destroy(&mut self, event: GlobalId) -> Result<(), Error> {
        self.send(Message::event_destroy(self.ctx.owner(event), event))
    }

    /// A new labeled range. Ids in it are made with [`Scope::id_from_index`].
    pub fn range_create(&mut self) -> Result<GlobalId, Error> {
        let map = self.block_on(self.ctx.fetcher.allocate_map_id())?;
        debug!(map, "range created");
        Ok(GlobalId::map_handle(map))
    }

    pub fn id_from_index(&self, range: GlobalId, index: u32) -> Result<GlobalId, Error> {
        if !range.is_map_handle() {
            return Err(Error::InvalidArgument("not a range handle"));
        }
        let map = range.map_id().ok_or(Error::InvalidArgument("not a range handle"))?;
        Ok(GlobalId::mapped(map, index))
    }

    /// Creates an event under a labeled id. With `CHECK` in `properties`
    /// several nodes may race to create the same one.
    pub fn labeled_event_create(
        &mut self,
        id: GlobalId,
        kind: EventKind,
        properties: u16,
        latch_initial: u64,
    ) -> Result<(), Error> {
        if !id.is_mapped() {
            return Err(Error::InvalidArgument("labeled creation needs an id from a range"));
        }
        let allow_concurrent = properties & properties::CHECK != 0;
        self.send(Message::mapped_event_create(
            self.ctx.owner(id),
            id,
            kind,
            properties,
            latch_initial,
            allow_concurrent,
        ))
    }

    /// Tells every node the application is done. Leaves after everything
    /// this scope sent before.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        let mut out = self.outbox();
        for node in 0..self.ctx.node_count {
            out.send(Message::control(Command::Shutdown, node))?;
        }
        debug!(node = self.ctx.me, "shutdown requested");
        Ok(())
    }
}
