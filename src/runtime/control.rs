//! Pause, flush, checkpoints and the cluster barrier.
//!
//! Control commands are handled even while a node is paused; everything
//! else that arrives then is parked and replayed, in arrival order, on
//! resume.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Arc, Mutex,
};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use super::context::Context;
use crate::{
    checkpoint::{Reader, Snapshot, Writer},
    directory::{lock, Object},
    error::Error,
    graph::task::Task,
    id::{GlobalId, NodeId},
    net::{Command, Message, SendMode, Windows},
};

pub(crate) struct Control {
    node_count: u32,
    paused: AtomicBool,
    /// Task bodies admitted and not yet done.
    running: AtomicUsize,
    idle: Notify,
    parked_messages: Mutex<Vec<Message>>,
    parked_tasks: Mutex<Vec<Arc<Mutex<Task>>>>,
    replies_tx: mpsc::UnboundedSender<Message>,
    /// Replies to a coordinator running on this node.
    pub replies: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    barrier_remaining: AtomicU32,
    barrier_waiter: Mutex<Option<oneshot::Sender<()>>>,
}

impl Control {
    pub fn new(node_count: u32) -> Self {
        let (replies_tx, replies) = mpsc::unbounded_channel();
        Self {
            node_count,
            paused: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            idle: Notify::new(),
            parked_messages: Mutex::new(Vec::new()),
            parked_tasks: Mutex::new(Vec::new()),
            replies_tx,
            replies: AsyncMutex::new(replies),
            barrier_remaining: AtomicU32::new(node_count),
            barrier_waiter: Mutex::new(None),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Counts a task as running, or parks it if the node is paused.
    pub fn admit(&self, task: &Arc<Mutex<Task>>) -> bool {
        self.running.fetch_add(1, Ordering::SeqCst);
        let mut parked = lock(&self.parked_tasks);
        if self.is_paused() {
            parked.push(task.clone());
            drop(parked);
            self.task_done();
            return false;
        }
        true
    }

    pub fn task_done(&self) {
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Stops admitting tasks and waits for the running ones.
    pub async fn pause(&self) {
        {
            let _parked = lock(&self.parked_tasks);
            self.paused.store(true, Ordering::SeqCst);
        }
        loop {
            let notified = self.idle.notified();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Lifts the pause and hands back what was parked.
    pub fn resume(&self) -> (Vec<Arc<Mutex<Task>>>, Vec<Message>) {
        let tasks = {
            let mut parked = lock(&self.parked_tasks);
            self.paused.store(false, Ordering::SeqCst);
            std::mem::take(&mut *parked)
        };
        (tasks, std::mem::take(&mut *lock(&self.parked_messages)))
    }

    pub fn park(&self, msg: Message) {
        lock(&self.parked_messages).push(msg);
    }

    fn parked(&self) -> (Vec<Message>, Vec<GlobalId>) {
        let messages = lock(&self.parked_messages).clone();
        let tasks = lock(&self.parked_tasks).iter().map(|task| lock(task).id()).collect();
        (messages, tasks)
    }

    fn restore_parked(&self, messages: Vec<Message>, tasks: Vec<Arc<Mutex<Task>>>) {
        *lock(&self.parked_messages) = messages;
        *lock(&self.parked_tasks) = tasks;
    }

    fn deliver(&self, msg: Message) -> Result<(), Error> {
        self.replies_tx.send(msg)?;
        Ok(())
    }

    /// Collects `count` replies of `command`.
    pub async fn collect(
        replies: &mut mpsc::UnboundedReceiver<Message>,
        command: Command,
        count: u32,
    ) -> Result<Vec<Message>, Error> {
        let mut collected = Vec::with_capacity(count as usize);
        while collected.len() < count as usize {
            let msg = replies.recv().await.ok_or(Error::ChannelClosed)?;
            if msg.command != command {
                warn!(expected = ?command, got = ?msg.command, from = msg.from, "stray control reply");
                continue;
            }
            collected.push(msg);
        }
        Ok(collected)
    }

    pub fn arm_barrier(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.barrier_waiter) = Some(tx);
        rx
    }

    /// On node 0: one more node reached the barrier. True when it was the
    /// last one; the count starts over.
    fn barrier_arrived(&self) -> bool {
        if self.barrier_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.barrier_remaining.store(self.node_count, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn barrier_done(&self) {
        match lock(&self.barrier_waiter).take() {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => warn!("barrier released with nobody waiting"),
        }
    }
}

impl Context {
    fn reply(&self, command: Command, to: NodeId) -> Result<(), Error> {
        self.post(SendMode::Direct(Message::control(command, to)))
    }

    /// Handles a control command. Returns the messages to replay.
    pub(crate) async fn control_message(self: &Arc<Self>, msg: Message) -> Result<Vec<Message>, Error> {
        match msg.command {
            Command::Pause => {
                self.control.pause().await;
                debug!(node = self.me, "paused");
                self.reply(Command::Paused, msg.from)?;
            }
            Command::Paused | Command::Flushed | Command::Saved | Command::Loaded => {
                self.control.deliver(msg)?;
            }
            Command::StartFlush => self.post(SendMode::StartFlush { origin: msg.from })?,
            Command::Flush => self.reply(Command::Reflush, msg.from)?,
            Command::Reflush => self.post(SendMode::Reflushed)?,
            Command::Resume => {
                let (tasks, messages) = self.control.resume();
                debug!(node = self.me, tasks = tasks.len(), messages = messages.len(), "resumed");
                for task in tasks {
                    self.spawn(task);
                }
                return Ok(messages);
            }
            Command::Save => {
                self.save().await?;
                self.reply(Command::Saved, msg.from)?;
            }
            Command::Load => {
                self.load()?;
                self.reply(Command::Loaded, msg.from)?;
            }
            Command::Barrier => {
                if self.control.barrier_arrived() {
                    for node in 0..self.node_count {
                        self.reply(Command::BarrierDone, node)?;
                    }
                }
            }
            Command::BarrierDone => self.control.barrier_done(),
            _ => return Err(Error::MalformedMessage("not a control command")),
        }
        Ok(Vec::new())
    }

    /// Waits until every node has called this.
    pub(crate) async fn barrier(&self) -> Result<(), Error> {
        let released = self.control.arm_barrier();
        self.reply(Command::Barrier, 0)?;
        Ok(released.await?)
    }

    async fn save(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.post(SendMode::Save(tx))?;
        let windows = rx.await?;
        let (messages, tasks) = self.control.parked();

        let mut snapshot = Snapshot::new(self.me, self.node_count);
        snapshot.write_value("map_sequence", u64::from(self.map_sequence.load(Ordering::SeqCst)));
        snapshot.write_value("finished", self.finished.load(Ordering::SeqCst) as u64);
        snapshot.write_value("slots", self.repository.slot_count() as u64);
        snapshot.write_sequence("objects", &self.repository.objects());
        snapshot.write_sequence("graveyard", &self.repository.graveyard());
        snapshot.write_sequence("cache", &self.cache.entries());
        snapshot.write_sequence("parked_messages", &messages);
        snapshot.write_sequence("parked_tasks", &tasks);
        snapshot.write_object("windows", &windows);
        snapshot.write_file(&self.config.checkpoint_dir)?;
        debug!(node = self.me, windows = windows.len(), "saved");
        Ok(())
    }

    fn load(self: &Arc<Self>) -> Result<(), Error> {
        let snapshot = Snapshot::read_file(&self.config.checkpoint_dir, self.me)?;
        if snapshot.node_count != self.node_count {
            return Err(Error::Checkpoint(format!(
                "snapshot of a {} node cluster loaded into {} nodes",
                snapshot.node_count, self.node_count
            )));
        }
        let mut r = snapshot.reader();
        let map_sequence = r.read_u32("map_sequence")?;
        let finished = r.read_bool("finished")?;
        let slots = r.read_value("slots")? as usize;
        let objects: Vec<(GlobalId, Object)> = r.read_sequence("objects")?;
        let graveyard: Vec<(GlobalId, Object)> = r.read_sequence("graveyard")?;
        let cache: Vec<(GlobalId, Object)> = r.read_sequence("cache")?;
        let messages: Vec<Message> = r.read_sequence("parked_messages")?;
        let parked: Vec<GlobalId> = r.read_sequence("parked_tasks")?;
        let windows: Windows = r.read_object("windows")?;
        if !r.is_done() {
            return Err(Error::Checkpoint("trailing fields in snapshot".into()));
        }

        self.repository.restore(slots, objects, graveyard)?;
        self.cache.restore(cache);
        self.relink_buffers()?;
        let tasks = parked
            .into_iter()
            .map(|id| self.object(id)?.task(id))
            .collect::<Result<Vec<_>, _>>()?;
        self.control.restore_parked(messages, tasks);

        let (unconfirmed, unsent) = windows.outstanding();
        self.counters.unconfirmed.store(unconfirmed, Ordering::SeqCst);
        self.counters.unsent.store(unsent, Ordering::SeqCst);
        self.post(SendMode::Restore(windows))?;

        self.map_sequence.store(map_sequence, Ordering::SeqCst);
        if self.finished.swap(finished, Ordering::SeqCst) != finished {
            if finished {
                self.shared.node_finished();
            } else {
                self.shared.node_unfinished();
            }
        }
        debug!(node = self.me, unconfirmed, unsent, "loaded");
        Ok(())
    }

    /// Buffers are not part of a task's checkpoint; tasks that hold locks
    /// but have not started take them from their blocks again.
    fn relink_buffers(&self) -> Result<(), Error> {
        for (_, object) in self.repository.objects() {
            let Object::Task(task) = object else {
                continue;
            };
            let blocks = lock(&task).locked_blocks();
            for block_id in blocks {
                let block = self.object(block_id)?.block(block_id)?;
                let buffer = lock(&block).buffer().cloned();
                if let Some(buffer) = buffer {
                    lock(&task).buffers.insert(block_id, buffer);
                }
            }
        }
        Ok(())
    }
}
