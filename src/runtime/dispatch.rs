use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::context::{Context, Outbox};
use crate::{
    block::{AccessMode, DataBlock},
    directory::{lock, Object},
    error::Error,
    graph::{
        event::{Event, EventKind},
        properties,
        task::Task,
        Postslot, Reaction, Vertex, LATCH_DECR_SLOT, LATCH_INCR_SLOT,
    },
    id::{GlobalId, NodeId},
    net::{Channel, Command, Message, SendMode},
};

/// Reads the main channel from `from` and feeds the dispatcher until that
/// node says `exit`.
pub(crate) async fn receive(ctx: Arc<Context>, from: NodeId, tx: mpsc::UnboundedSender<Message>) {
    let span = debug_span!("receiver", node = ctx.me, from);
    async move {
        while let Some(bytes) = ctx.transport.receive(Channel::Main, from).await {
            let msg = match Message::decode(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    ctx.fatal(e);
                    break;
                }
            };
            if msg.command == Command::Exit {
                break;
            }
            trace!(cmd = ?msg.command, sender = %msg.sender, id = msg.id, "receive");
            if tx.send(msg).is_err() {
                break;
            }
        }
        debug!("receiver stopped");
    }
    .instrument(span)
    .await
}

/// Serves pulls and id allocation for `from`, and completes our own
/// requests to it.
pub(crate) async fn serve_fetch(ctx: Arc<Context>, from: NodeId) {
    let span = debug_span!("fetch", node = ctx.me, from);
    async move {
        while let Some(bytes) = ctx.transport.receive(Channel::Fetch, from).await {
            let result = match Message::decode(&bytes) {
                Ok(msg) if msg.command == Command::Exit => break,
                Ok(msg) => ctx.fetch_message(msg),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                ctx.fatal(e);
                break;
            }
        }
        debug!("fetch loop stopped");
    }
    .instrument(span)
    .await
}

/// Handles every main-channel message of one node, one at a time.
pub(crate) async fn dispatch(ctx: Arc<Context>, mut rx: mpsc::UnboundedReceiver<Message>) {
    let span = debug_span!("dispatcher", node = ctx.me);
    async move {
        debug!("dispatcher started");
        let mut replay = VecDeque::new();
        loop {
            let msg = match replay.pop_front() {
                Some(msg) => msg,
                None => match rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if ctx.shared.is_failed() {
                continue;
            }
            match ctx.dispatch(msg).await {
                Ok(parked) => replay.extend(parked),
                Err(e) => ctx.fatal(e),
            }
        }
        debug!("dispatcher stopped");
    }
    .instrument(span)
    .await
}

impl Context {
    fn fetch_message(&self, msg: Message) -> Result<(), Error> {
        let from = msg.from;
        match msg.command {
            Command::PullObject => {
                let id = msg.id_at(0);
                let reply = match self.object(id)? {
                    Object::Template(template) => Message::push_edt_template(from, &template),
                    Object::Block(block) => {
                        let block = lock(&block);
                        Message::push_db(from, id, block.len(), block.allocator())
                    }
                    object => Message::push_proxy(from, id, object.kind()),
                };
                self.fetcher.reply(reply)
            }
            Command::AllocateGuid => {
                let count = self.config.preallocate_count.max(1);
                let first = self.repository.preallocate_objects(count);
                self.fetcher.reply(Message::allocated_guid(from, first, count))
            }
            Command::AllocateMapId if self.me == 0 => {
                let map = self.map_sequence.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                self.fetcher.reply(Message::allocated_map_id(from, map))
            }
            Command::PushEdtTemplate
            | Command::PushDb
            | Command::PushProxy
            | Command::AllocatedGuid
            | Command::AllocatedMapId => self.fetcher.complete(from, msg),
            _ => Err(Error::MalformedMessage("unexpected command on the fetch channel")),
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) -> Result<Vec<Message>, Error> {
        if msg.command.is_control() {
            return self.control_message(msg).await;
        }
        if self.control.is_paused() {
            trace!(cmd = ?msg.command, "parked");
            self.control.park(msg);
            return Ok(Vec::new());
        }
        for id in msg.objects_needed() {
            if !id.is_null() {
                self.resolve(id).await?;
            }
        }
        for id in msg.objects_to_fetch() {
            if !id.is_null() && !id.is_uninitialized() && !self.is_local(id) {
                self.resolve(id).await?;
            }
        }
        trace!(cmd = ?msg.command, from = msg.from, sender = %msg.sender, id = msg.id, "dispatch");
        let mut out = Outbox::handling(self, &msg);
        self.handle(msg, &mut out)?;
        out.finish()?;
        Ok(Vec::new())
    }

    fn handle(self: &Arc<Self>, msg: Message, out: &mut Outbox<'_>) -> Result<(), Error> {
        match msg.command {
            Command::Confirmation => self.post(SendMode::Confirmed { task: msg.id_at(0), id: msg.a[1] }),
            Command::Shutdown => {
                self.node_finished();
                Ok(())
            }
            Command::PushEdtTemplate => {
                let template = msg.template()?;
                self.cache.insert(template.id, Object::Template(Arc::new(template)));
                Ok(())
            }
            Command::EdtCreate => self.edt_create(&msg, out),
            Command::EdtStartTrivial => {
                let id = msg.id_at(0);
                let task = self.object(id)?.task(id)?;
                self.acquire(&task)
            }
            Command::DbCreate => {
                let id = msg.id_at(0);
                let block = DataBlock::new(id, self.me, self.me, msg.a[1], msg.a[2] as u16, msg.a[4]);
                self.repository.set_object(id, Object::Block(Arc::new(Mutex::new(block))))
            }
            Command::MappedDbCreate => {
                let id = msg.id_at(0);
                let block = DataBlock::invalid(id, self.me, self.me, msg.a[1], msg.a[4], msg.u32_at(5));
                if !self.repository.add_mapped_object(id, Object::Block(Arc::new(Mutex::new(block)))) {
                    return Err(Error::AlreadyExists(id));
                }
                Ok(())
            }
            Command::MappedEventCreate => self.mapped_event_create(&msg),
            Command::EventDestroy => {
                let id = msg.id_at(0);
                let event = self.object(id)?.event(id)?;
                if !lock(&event).destroy() {
                    warn!(event = %id, "event destroyed twice");
                }
                if id.is_mapped() {
                    self.repository.remove_mapped_object(id, true);
                }
                Ok(())
            }
            Command::DbDestroy => {
                let id = msg.id_at(0);
                let block = self.object(id)?.block(id)?;
                let mut fx = Vec::new();
                lock(&block).destroy(&mut fx)?;
                self.drive_block(id, fx)
            }
            Command::AddPreslot => {
                let (source, destination, slot) = (msg.id_at(0), msg.id_at(1), msg.u32_at(2));
                let mode = AccessMode::try_from(msg.a[3] as u8)?;
                let vertex = Vertex::from_object(destination, self.object(destination)?)?;
                let reaction = vertex.add_preslot(source, mode, slot)?;
                self.react(destination, reaction, out)?;
                if !source.is_null() {
                    out.send(Message::add_postslot(self.owner(source), source, destination, slot, mode))?;
                }
                Ok(())
            }
            Command::AddPostslot => {
                let (source, destination, slot) = (msg.id_at(0), msg.id_at(1), msg.u32_at(2));
                let object = self.object(source)?;
                if let Object::Block(_) = object {
                    return out.send(Message::satisfy_preslot(self.owner(destination), source, destination, slot));
                }
                let signals = Vertex::from_object(source, object)?.add_postslot(Postslot { destination, slot })?;
                for signal in signals {
                    out.signal(signal)?;
                }
                Ok(())
            }
            Command::SatisfyPreslot => {
                let (data, destination, slot) = (msg.id_at(0), msg.id_at(1), msg.u32_at(2));
                let vertex = Vertex::from_object(destination, self.object(destination)?)?;
                let reaction = vertex.satisfy(slot, data)?;
                self.react(destination, reaction, out)
            }
            Command::SatisfyPreslotWithData => {
                let (destination, slot) = (msg.id_at(0), msg.u32_at(1));
                let mode = AccessMode::try_from(msg.a[3] as u8)?;
                let id = self.repository.preallocate_object();
                let block = DataBlock::with_data(id, self.me, self.me, msg.payload, 0, 0);
                self.repository.set_object(id, Object::Block(Arc::new(Mutex::new(block))))?;
                let vertex = Vertex::from_object(destination, self.object(destination)?)?;
                vertex.add_preslot(id, mode, slot)?;
                let reaction = vertex.satisfy(slot, id)?;
                self.react(destination, reaction, out)
            }
            command if command.is_replication() => {
                let from = msg.from;
                let (id, inner) = msg.block_message()?;
                let block = self.object(id)?.block(id)?;
                let mut fx = Vec::new();
                lock(&block).handle(from, inner, &mut fx)?;
                self.drive_block(id, fx)
            }
            _ => Err(Error::MalformedMessage("unexpected command on the main channel")),
        }
    }

    /// Builds the task and its output event, then wires them up. The edges
    /// leave from the handler's own window, in this order: the output event
    /// into the parent's finish latch, the task into its output event, every
    /// listed dependency into the task, and the trivial start.
    fn edt_create(self: &Arc<Self>, msg: &Message, out: &mut Outbox<'_>) -> Result<(), Error> {
        let create = msg.edt_create_fields();
        let template = self.object(create.template)?.template(create.template)?;
        let (_, depc) = template.counts(create.params.len() as u32, create.depc);
        let finish = create.properties & properties::FINISH != 0;
        let finish_for_children = if finish { create.event } else { create.parent_finish };

        let task = Arc::new(Mutex::new(Task::new(
            create.task,
            template.id,
            template.function,
            template.name.clone(),
            create.params,
            depc,
            create.event,
            finish_for_children,
        )));
        if create.task.is_mapped() {
            if !self.repository.add_mapped_object(create.task, Object::Task(task.clone())) {
                if create.properties & properties::CHECK == 0 {
                    return Err(Error::AlreadyExists(create.task));
                }
                debug!(task = %create.task, "labeled task already exists");
                return Ok(());
            }
        } else {
            self.repository.set_object(create.task, Object::Task(task.clone()))?;
        }
        let event = if finish {
            Event::new(create.event, EventKind::Latch, false, 0)
        } else {
            Event::new(create.event, EventKind::Once, true, 0)
        };
        self.repository.set_object(create.event, Object::Event(Arc::new(Mutex::new(event))))?;

        if !create.parent_finish.is_null() {
            self.add_dependence(out, create.event, create.parent_finish, LATCH_DECR_SLOT)?;
        }
        if finish {
            out.send(Message::satisfy_preslot(self.me, GlobalId::NULL, create.event, LATCH_INCR_SLOT))?;
            self.add_dependence(out, create.task, create.event, LATCH_DECR_SLOT)?;
        } else {
            self.add_dependence(out, create.task, create.event, 0)?;
        }
        for (slot, dep) in create.deps.iter().flatten().enumerate() {
            if !dep.is_uninitialized() {
                self.add_dependence(out, *dep, create.task, slot as u32)?;
            }
        }
        if depc == 0 {
            out.send(Message::edt_start_trivial(self.me, create.task))?;
        }
        debug!(task = %create.task, name = %template.name, depc, finish, "task created");

        if lock(&task).make_ready() {
            self.spawn(task);
        }
        Ok(())
    }

    fn add_dependence(
        &self,
        out: &mut Outbox<'_>,
        source: GlobalId,
        destination: GlobalId,
        slot: u32,
    ) -> Result<(), Error> {
        out.send(Message::add_preslot(self.owner(destination), source, destination, slot, AccessMode::DEFAULT))
    }

    fn mapped_event_create(&self, msg: &Message) -> Result<(), Error> {
        let id = msg.id_at(0);
        let kind = EventKind::try_from(msg.a[1] as u8)?;
        let takes_arg = msg.a[2] as u16 & properties::TAKES_ARG != 0;
        let event = Event::new(id, kind, takes_arg, msg.a[3]);
        let allow_concurrent = msg.a[4] != 0;
        if !self.repository.add_mapped_object(id, Object::Event(Arc::new(Mutex::new(event)))) && !allow_concurrent {
            return Err(Error::AlreadyExists(id));
        }
        Ok(())
    }

    /// Carries out what a vertex asked for. A task that became runnable and
    /// an event that fired both release the message being handled first.
    fn react(self: &Arc<Self>, id: GlobalId, reaction: Reaction, out: &mut Outbox<'_>) -> Result<(), Error> {
        match reaction {
            Reaction::Pending => Ok(()),
            Reaction::Runnable => {
                out.finish()?;
                let task = self.object(id)?.task(id)?;
                self.acquire(&task)
            }
            Reaction::Event(fire) => {
                if fire.fired || fire.signals.len() > 1 {
                    out.finish()?;
                }
                if fire.destroyed && id.is_mapped() {
                    self.repository.remove_mapped_object(id, true);
                }
                for signal in fire.signals {
                    out.signal(signal)?;
                }
                Ok(())
            }
        }
    }
}
