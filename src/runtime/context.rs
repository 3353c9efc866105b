use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use tokio::{
    runtime::Handle,
    sync::{mpsc, Notify, Semaphore},
};
use tracing::{debug, debug_span, error, trace, Instrument};

use super::{api::Scope, control::Control};
use crate::{
    block::{DataBlock, Effect},
    config::Config,
    directory::{lock, Cache, Lookup, Object, ObjectKind, Repository},
    error::Error,
    graph::{task::Task, template::Registry, Signal},
    id::{GlobalId, NodeId, NULL_SLOT},
    net::{Command, Confirmation, Counters, Fetcher, Message, SendMode, Stats, Transport},
};

/// State every node of a cluster shares: how many nodes still have to see
/// `shutdown`, and the first fatal error.
pub(crate) struct Shared {
    failure: Mutex<Option<Error>>,
    failed: AtomicBool,
    stopping: AtomicBool,
    remaining: AtomicU32,
    notify: Notify,
}

impl Shared {
    pub fn new(nodes: u32) -> Self {
        Self {
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            remaining: AtomicU32::new(nodes),
            notify: Notify::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Keeps the first error only.
    pub fn fail(&self, error: Error) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(error);
        }
        self.failed.store(true, Ordering::SeqCst);
        drop(failure);
        self.notify.notify_waiters();
    }

    fn take_failure(&self) -> Error {
        lock(&self.failure).take().unwrap_or(Error::ShutDown)
    }

    pub fn node_finished(&self) {
        self.remaining.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn node_unfinished(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    /// Until every node has seen `shutdown`, or the first fatal error.
    pub async fn wait(&self) -> Result<(), Error> {
        loop {
            let notified = self.notify.notified();
            if self.is_failed() {
                return Err(self.take_failure());
            }
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Resolves with the first fatal error.
    pub async fn failed(&self) -> Error {
        loop {
            let notified = self.notify.notified();
            if self.is_failed() {
                return self.take_failure();
            }
            notified.await;
        }
    }
}

/// One node of the runtime.
pub struct Context {
    pub(crate) me: NodeId,
    pub(crate) node_count: u32,
    pub(crate) config: Config,
    pub(crate) registry: Arc<Registry>,
    pub(crate) repository: Repository,
    pub(crate) cache: Cache,
    pub(crate) outgoing: mpsc::UnboundedSender<SendMode>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) fetcher: Fetcher,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) control: Control,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) affinity_cursor: AtomicU32,
    /// Last map id handed out; only node 0 serves them.
    pub(crate) map_sequence: AtomicU32,
    pub(crate) finished: AtomicBool,
    pub(crate) runtime: Handle,
    pub(crate) shared: Arc<Shared>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        me: NodeId,
        config: Config,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        outgoing: mpsc::UnboundedSender<SendMode>,
        counters: Arc<Counters>,
        stats: Arc<Stats>,
        shared: Arc<Shared>,
        runtime: Handle,
    ) -> Self {
        let node_count = config.nodes;
        Self {
            me,
            node_count,
            registry,
            repository: Repository::new(me),
            cache: Cache::new(node_count),
            outgoing,
            counters,
            fetcher: Fetcher::new(me, transport.clone(), stats.clone()),
            stats,
            transport,
            control: Control::new(node_count),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            affinity_cursor: AtomicU32::new(0),
            map_sequence: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            runtime,
            shared,
            config,
        }
    }

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Messages of this node that have not completed their round trip.
    pub fn outstanding(&self) -> u64 {
        self.counters.outstanding()
    }

    /// Sends on behalf of the runtime itself rather than of a task. On
    /// node 0 this is the null id, whose owner is node 0 all the same.
    pub(crate) fn runtime_sender(&self) -> GlobalId {
        GlobalId::direct(self.me, NULL_SLOT)
    }

    pub(crate) fn owner(&self, id: GlobalId) -> NodeId {
        id.owner(self.node_count)
    }

    pub(crate) fn is_local(&self, id: GlobalId) -> bool {
        id.is_local(self.me, self.node_count)
    }

    pub(crate) fn post(&self, mode: SendMode) -> Result<(), Error> {
        self.outgoing.send(mode)?;
        Ok(())
    }

    pub(crate) fn fatal(&self, error: Error) {
        if self.shared.is_stopping() {
            debug!(node = self.me, %error, "ignored while stopping");
            return;
        }
        error!(node = self.me, %error, "fatal");
        self.shared.fail(error);
    }

    /// Counts this node as done once.
    pub(crate) fn node_finished(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            debug!(node = self.me, "shutdown received");
            self.shared.node_finished();
        }
    }

    /// An object known on this node, without fetching.
    pub(crate) fn object(&self, id: GlobalId) -> Result<Object, Error> {
        let found = if self.is_local(id) {
            self.repository.get_object(id)
        } else {
            self.cache.get(id)
        };
        found.ok_or(Error::UnknownObject(id))
    }

    /// An object, fetched from its owner when it is not known yet. At most
    /// one fetch per id is ever in flight.
    pub(crate) async fn resolve(&self, id: GlobalId) -> Result<Object, Error> {
        if self.is_local(id) {
            return self.repository.get_object(id).ok_or(Error::UnknownObject(id));
        }
        match self.cache.lookup(id) {
            Lookup::Ready(object) => Ok(object),
            Lookup::Wait(rx) => Ok(rx.await?),
            Lookup::Fetch => {
                let reply = self.fetcher.pull(id, self.owner(id)).await?;
                let object = self.adopt(id, &reply)?;
                trace!(%id, kind = ?object.kind(), "fetched");
                self.cache.complete(id, object.clone());
                Ok(object)
            }
        }
    }

    /// Builds the local stand-in for a pulled object.
    fn adopt(&self, id: GlobalId, reply: &Message) -> Result<Object, Error> {
        let owner = self.owner(id);
        match reply.command {
            Command::PushDb => Ok(Object::Block(Arc::new(Mutex::new(DataBlock::invalid(
                id, self.me, owner, reply.a[1], reply.a[2], owner,
            ))))),
            Command::PushProxy => Ok(Object::Proxy(ObjectKind::try_from(reply.a[1] as u8)?)),
            Command::PushEdtTemplate => Ok(Object::Template(Arc::new(reply.template()?))),
            _ => Err(Error::MalformedMessage("unexpected reply to a pull")),
        }
    }

    /// A fresh id in the repository of `node`.
    pub(crate) async fn reserve_id(&self, node: NodeId) -> Result<GlobalId, Error> {
        if node == self.me {
            return Ok(self.repository.preallocate_object());
        }
        self.cache.reserve_id(node, || self.fetcher.allocate_guid(node)).await
    }

    /// Applies what a block asked for once its lock is released. Messages
    /// to this node are handled right here, in order.
    pub(crate) fn drive_block(self: &Arc<Self>, block: GlobalId, fx: Vec<Effect>) -> Result<(), Error> {
        let mut pending: std::collections::VecDeque<Effect> = fx.into();
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Send { to, msg } if to == self.me => {
                    let object = self.object(block)?.block(block)?;
                    let mut fx = Vec::new();
                    lock(&object).handle(self.me, msg, &mut fx)?;
                    pending.extend(fx);
                }
                Effect::Send { to, msg } => {
                    let mut msg = Message::block(to, block, msg);
                    msg.sender = self.runtime_sender();
                    self.post(SendMode::Direct(msg))?;
                }
                Effect::Granted { task, buffer } => {
                    let handle = self.object(task)?.task(task)?;
                    lock(&handle).block_acquired(block, buffer)?;
                    self.acquire(&handle)?;
                }
                Effect::RemoteUpdated(task) => self.remote_updated(task)?,
            }
        }
        Ok(())
    }

    /// Locks the task's blocks in order from where it left off. Stops at the
    /// first block that is not available; its grant resumes the walk.
    pub(crate) fn acquire(self: &Arc<Self>, task: &Arc<Mutex<Task>>) -> Result<(), Error> {
        loop {
            let (task_id, next) = {
                let task = lock(task);
                (task.id(), task.next_block())
            };
            let Some((block_id, mode)) = next else {
                if lock(task).all_acquired() {
                    self.spawn(task.clone());
                }
                return Ok(());
            };
            let block = self.object(block_id)?.block(block_id)?;
            let mut fx = Vec::new();
            let granted = {
                let mut block = lock(&block);
                if block.try_lock(task_id, mode, &mut fx) {
                    Some(block.buffer().cloned())
                } else {
                    None
                }
            };
            let waiting = granted.is_none();
            if let Some(buffer) = granted {
                lock(task).block_acquired(block_id, buffer)?;
            }
            self.drive_block(block_id, fx)?;
            if waiting {
                trace!(task = %task_id, block = %block_id, ?mode, "waiting for lock");
                return Ok(());
            }
        }
    }

    /// Hands a task to the worker pool, or parks it while paused.
    pub(crate) fn spawn(self: &Arc<Self>, task: Arc<Mutex<Task>>) {
        if !self.control.admit(&task) {
            return;
        }
        let id = lock(&task).id();
        let ctx = self.clone();
        let span = debug_span!("task", node = self.me, %id);
        self.runtime.spawn(
            async move {
                if let Err(e) = ctx.run_task(&task).await {
                    ctx.fatal(e);
                }
                ctx.control.task_done();
            }
            .instrument(span),
        );
    }

    async fn run_task(self: &Arc<Self>, task: &Arc<Mutex<Task>>) -> Result<(), Error> {
        let _permit = self.workers.clone().acquire_owned().await.map_err(|_| Error::ShutDown)?;
        let (id, function, finish_scope, params, deps) = {
            let mut task = lock(task);
            let (params, deps) = task.start();
            (task.id(), task.function(), task.finish_scope(), params, deps)
        };
        let body = self.registry.get(function)?;
        trace!("running");
        let ctx = self.clone();
        let handle = task.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut scope = Scope::task(&ctx, id, handle, finish_scope);
            body(&mut scope, &params, &deps)
        })
        .await
        .map_err(|_| Error::TaskPanicked(id))??;
        self.task_finished(task, result)
    }

    /// The body returned `result`. Written blocks with copies elsewhere
    /// hold the task back until every copy is invalidated.
    pub(crate) fn task_finished(self: &Arc<Self>, task: &Arc<Mutex<Task>>, result: GlobalId) -> Result<(), Error> {
        let (task_id, held, mut done) = {
            let mut task = lock(task);
            let done = task.finished(result).then(|| task.notifications());
            (task.id(), task.held_blocks(), done)
        };
        for (block_id, mode) in held {
            let visible = if mode.writes() {
                let block = self.object(block_id)?.block(block_id)?;
                let mut fx = Vec::new();
                let visible = lock(&block).writer_finished(task_id, &mut fx);
                self.drive_block(block_id, fx)?;
                visible
            } else {
                true
            };
            if visible {
                let mut task = lock(task);
                if task.release_one() {
                    // taken under the same lock as the count reaching zero,
                    // so a concurrent add_postslot signals by itself
                    done = Some(task.notifications());
                }
            }
        }
        if let Some(signals) = done {
            self.complete(task, signals)?;
        }
        Ok(())
    }

    /// A copy invalidation the task was waiting for has finished.
    pub(crate) fn remote_updated(self: &Arc<Self>, task_id: GlobalId) -> Result<(), Error> {
        let task = self.object(task_id)?.task(task_id)?;
        let done = {
            let mut task = lock(&task);
            task.release_one().then(|| task.notifications())
        };
        if let Some(signals) = done {
            self.complete(&task, signals)?;
        }
        Ok(())
    }

    /// Releases every lock the task holds and satisfies its post-slots.
    fn complete(self: &Arc<Self>, task: &Arc<Mutex<Task>>, signals: Vec<Signal>) -> Result<(), Error> {
        let (task_id, held) = {
            let task = lock(task);
            (task.id(), task.held_blocks())
        };
        for (block_id, mode) in held {
            let block = self.object(block_id)?.block(block_id)?;
            let mut fx = Vec::new();
            lock(&block).unlock(mode, &mut fx)?;
            self.drive_block(block_id, fx)?;
        }
        let mut out = Outbox::task(self, task_id);
        for signal in signals {
            out.signal(signal)?;
        }
        debug!(task = %task_id, "task complete");
        Ok(())
    }
}

struct Handling {
    command: Command,
    kind: Confirmation,
    sender: GlobalId,
    id: u64,
    forwarded: bool,
    /// Sending identity of a handler that acts as a task.
    as_task: GlobalId,
}

/// Everything a handler or task sends goes through here, so that each
/// message leaves under the right sending task and the message being handled
/// is confirmed exactly once.
pub(crate) struct Outbox<'a> {
    ctx: &'a Arc<Context>,
    sender: GlobalId,
    handling: Option<Handling>,
}

impl<'a> Outbox<'a> {
    /// Sends everything as `sender`, numbered in its window.
    pub fn task(ctx: &'a Arc<Context>, sender: GlobalId) -> Self {
        Self { ctx, sender, handling: None }
    }

    /// Sends on behalf of the handler of `msg`.
    pub fn handling(ctx: &'a Arc<Context>, msg: &Message) -> Self {
        let handling = (msg.id != 0 && msg.command != Command::Confirmation).then(|| Handling {
            command: msg.command,
            kind: msg.command.confirmation(),
            sender: msg.sender,
            id: msg.id,
            forwarded: false,
            as_task: GlobalId::NULL,
        });
        Self { ctx, sender: ctx.runtime_sender(), handling }
    }

    pub fn send(&mut self, mut msg: Message) -> Result<(), Error> {
        if let Some(handling) = self.handling.as_mut() {
            match handling.kind {
                Confirmation::Single => return Err(Error::UnexpectedSend(handling.command)),
                Confirmation::Forward => {
                    handling.forwarded = true;
                    msg.sender = handling.sender;
                    msg.id = handling.id;
                    return self.ctx.post(SendMode::Followup(msg));
                }
                Confirmation::Task => {
                    if handling.as_task.is_null() {
                        handling.as_task = self.ctx.repository.preallocate_object();
                    }
                    msg.sender = handling.as_task;
                    return self.ctx.post(SendMode::Standard(msg));
                }
                Confirmation::None | Confirmation::Special => {}
            }
        }
        msg.sender = self.sender;
        self.ctx.post(SendMode::Standard(msg))
    }

    pub fn signal(&mut self, signal: Signal) -> Result<(), Error> {
        self.send(Message::satisfy_preslot(
            self.ctx.owner(signal.destination),
            signal.data,
            signal.destination,
            signal.slot,
        ))
    }

    /// Confirms the message being handled, unless a forwarded message or
    /// the handler's own window carries the confirmation. Later sends go
    /// out as the runtime.
    pub fn finish(&mut self) -> Result<(), Error> {
        let Some(handling) = self.handling.take() else {
            return Ok(());
        };
        let to = handling.sender.owner(self.ctx.node_count);
        let mut confirmation = Message::confirmation(to, handling.sender, handling.id);
        confirmation.sender = self.ctx.runtime_sender();
        match handling.kind {
            Confirmation::Single => self.ctx.post(SendMode::Direct(confirmation)),
            Confirmation::Forward if !handling.forwarded => {
                self.ctx.post(SendMode::Direct(confirmation))
            }
            Confirmation::Task if handling.as_task.is_null() => {
                self.ctx.post(SendMode::Direct(confirmation))
            }
            Confirmation::Task => {
                confirmation.sender = handling.as_task;
                self.ctx.post(SendMode::Standard(confirmation))
            }
            _ => Ok(()),
        }
    }
}
