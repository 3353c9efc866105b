use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    transport::{Channel, Transport},
    wire::{Command, Message},
};
use crate::{
    checkpoint::{Checkpoint, Reader, Writer},
    error::Error,
    hex::HexDisplayExt,
    id::{GlobalId, NodeId},
};

/// How a message enters the sender loop.
#[derive(Debug)]
pub enum SendMode {
    /// Numbered and held back until the sending task's previous message
    /// is confirmed.
    Standard(Message),
    /// Forwarded on behalf of the message being handled; keeps its sender
    /// and id and goes out at once.
    Followup(Message),
    /// Confirmations and control traffic; goes out at once.
    Direct(Message),
    /// A confirmation came back for one of our messages.
    Confirmed { task: GlobalId, id: u64 },
    /// Open a flush epoch on behalf of `origin`.
    StartFlush { origin: NodeId },
    /// A node answered our flush.
    Reflushed,
    Save(oneshot::Sender<Windows>),
    Restore(Windows),
    /// Tell every node's receivers we are gone and stop.
    Stop,
}

/// Node-wide totals over every window.
#[derive(Debug, Default)]
pub struct Counters {
    pub unconfirmed: AtomicU64,
    pub unsent: AtomicU64,
}

impl Counters {
    /// Messages that have not completed their round trip.
    pub fn outstanding(&self) -> u64 {
        self.unconfirmed.load(Ordering::SeqCst) + self.unsent.load(Ordering::SeqCst)
    }
}

/// Messages and bytes sent per command.
#[derive(Debug)]
pub struct Stats {
    counts: Vec<AtomicU64>,
    bytes: Vec<AtomicU64>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            counts: (0..Command::COUNT).map(|_| AtomicU64::new(0)).collect(),
            bytes: (0..Command::COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Stats {
    pub fn record(&self, command: Command, len: usize) {
        self.counts[command.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[command.index()].fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn count(&self, command: Command) -> u64 {
        self.counts[command.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// (command, messages, bytes) for every command sent at least once.
    pub fn snapshot(&self) -> Vec<(Command, u64, u64)> {
        (0..Command::COUNT)
            .filter_map(|i| {
                let count = self.counts[i].load(Ordering::Relaxed);
                let command = Command::try_from(i as u8).ok()?;
                (count > 0).then(|| (command, count, self.bytes[i].load(Ordering::Relaxed)))
            })
            .collect()
    }
}

/// Send state of one sending task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskWindow {
    todo: VecDeque<Message>,
    last_sent: u64,
    last_confirmed: u64,
    id_sequence: u64,
}

impl Default for TaskWindow {
    fn default() -> Self {
        Self { todo: VecDeque::new(), last_sent: 0, last_confirmed: 0, id_sequence: 1 }
    }
}

impl TaskWindow {
    fn is_clear(&self) -> bool {
        self.last_confirmed == self.last_sent
    }

    fn put_on_wire(&mut self, msg: &Message, counters: &Counters) {
        self.last_sent = msg.id;
        if msg.command.confirmation().auto_confirms() {
            self.last_confirmed = self.last_sent;
        } else {
            counters.unconfirmed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Every sending task's window. A window is dropped once it has nothing in
/// flight, so a task that sends again later starts over at id 1.
#[derive(Clone, Debug, Default)]
pub struct Windows {
    windows: HashMap<GlobalId, TaskWindow>,
}

impl Windows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// (unconfirmed, unsent) over every window, for rebuilding [`Counters`].
    pub fn outstanding(&self) -> (u64, u64) {
        self.windows.values().fold((0, 0), |(unconfirmed, unsent), w| {
            (unconfirmed + (w.last_sent - w.last_confirmed), unsent + w.todo.len() as u64)
        })
    }

    /// Numbers `msg` and returns it if it may go out now.
    pub fn standard(&mut self, mut msg: Message, counters: &Counters) -> Option<Message> {
        let sender = msg.sender;
        let window = self.windows.entry(sender).or_default();
        msg.id = window.id_sequence;
        window.id_sequence += 1;
        if !window.is_clear() {
            trace!(%sender, id = msg.id, cmd = ?msg.command, "enqueue");
            window.todo.push_back(msg);
            counters.unsent.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        window.put_on_wire(&msg, counters);
        if window.is_clear() {
            self.windows.remove(&sender);
        }
        Some(msg)
    }

    /// Applies a confirmation and returns the messages it released.
    pub fn confirm(
        &mut self,
        task: GlobalId,
        id: u64,
        counters: &Counters,
    ) -> Result<Vec<Message>, Error> {
        let window = self.windows.get_mut(&task).ok_or(Error::ConfirmationOutOfOrder {
            task,
            expected: 0,
            received: id,
        })?;
        if id != window.last_confirmed + 1 || id > window.last_sent {
            return Err(Error::ConfirmationOutOfOrder {
                task,
                expected: window.last_confirmed + 1,
                received: id,
            });
        }
        window.last_confirmed = id;
        counters.unconfirmed.fetch_sub(1, Ordering::SeqCst);
        let mut released = Vec::new();
        while window.is_clear() {
            let Some(msg) = window.todo.pop_front() else {
                break;
            };
            counters.unsent.fetch_sub(1, Ordering::SeqCst);
            window.put_on_wire(&msg, counters);
            released.push(msg);
        }
        if window.is_clear() && window.todo.is_empty() {
            self.windows.remove(&task);
        }
        Ok(released)
    }
}

impl Checkpoint for TaskWindow {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_sequence("todo", &self.todo);
        w.write_value("last_sent", self.last_sent);
        w.write_value("last_confirmed", self.last_confirmed);
        w.write_value("id_sequence", self.id_sequence);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            todo: r.read_sequence::<Message>("todo")?.into(),
            last_sent: r.read_value("last_sent")?,
            last_confirmed: r.read_value("last_confirmed")?,
            id_sequence: r.read_value("id_sequence")?,
        })
    }
}

impl Checkpoint for Windows {
    fn save<W: Writer>(&self, w: &mut W) {
        let mut windows: Vec<_> = self.windows.iter().collect();
        windows.sort_by_key(|(task, _)| **task);
        w.write_value("windows", windows.len() as u64);
        for (task, window) in windows {
            task.save(w);
            window.save(w);
        }
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        let count = r.read_value("windows")?;
        let mut windows = HashMap::new();
        for _ in 0..count {
            let task = GlobalId::load(r)?;
            windows.insert(task, TaskWindow::load(r)?);
        }
        Ok(Self { windows })
    }
}

struct Flush {
    origin: NodeId,
    remaining: u32,
    dirty: bool,
}

/// Owns the windows of one node and puts its main-channel traffic on the
/// wire.
pub struct SenderLoop {
    me: NodeId,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    stats: Arc<Stats>,
    windows: Windows,
    flush: Option<Flush>,
}

impl SenderLoop {
    pub fn new(
        me: NodeId,
        transport: Arc<dyn Transport>,
        counters: Arc<Counters>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { me, transport, counters, stats, windows: Windows::new(), flush: None }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SendMode>) -> Result<(), Error> {
        let span = debug_span!("sender", node = self.me);
        async move {
            debug!("sender loop started");
            while let Some(mode) = rx.recv().await {
                if !self.step(mode)? {
                    break;
                }
            }
            debug!(windows = self.windows.len(), "sender loop stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Handles one request. Returns false once the loop should stop.
    pub fn step(&mut self, mode: SendMode) -> Result<bool, Error> {
        match mode {
            SendMode::Standard(msg) => {
                if let Some(msg) = self.windows.standard(msg, &self.counters) {
                    self.transmit(msg)?;
                }
            }
            SendMode::Followup(msg) | SendMode::Direct(msg) => self.transmit(msg)?,
            SendMode::Confirmed { task, id } => {
                for msg in self.windows.confirm(task, id, &self.counters)? {
                    trace!(sender = %msg.sender, id = msg.id, "send delayed");
                    self.transmit(msg)?;
                }
            }
            SendMode::StartFlush { origin } => {
                if self.flush.is_some() {
                    warn!(origin, "flush already in progress");
                    return Ok(true);
                }
                let nodes = self.transport.node_count();
                self.flush = Some(Flush { origin, remaining: nodes, dirty: false });
                for node in 0..nodes {
                    self.transmit(Message::flush(node, origin))?;
                }
            }
            SendMode::Reflushed => self.reflushed()?,
            SendMode::Save(reply) => {
                let _ = reply.send(self.windows.clone());
            }
            SendMode::Restore(windows) => self.windows = windows,
            SendMode::Stop => {
                for node in 0..self.transport.node_count() {
                    let exit = Message::control(Command::Exit, node);
                    self.transmit(exit.clone())?;
                    let mut exit = exit;
                    exit.from = self.me;
                    self.transport.send(Channel::Fetch, node, exit.encode())?;
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn reflushed(&mut self) -> Result<(), Error> {
        let Some(flush) = self.flush.as_mut() else {
            warn!("reflush outside a flush epoch");
            return Ok(());
        };
        flush.remaining -= 1;
        if flush.remaining > 0 {
            return Ok(());
        }
        let Flush { origin, dirty, .. } = self.flush.take().ok_or(Error::ShutDown)?;
        if dirty {
            return Err(Error::FlushFailed { node: self.me });
        }
        debug!(outstanding = self.counters.outstanding(), "flush ok");
        let mut flushed = Message::control(Command::Flushed, origin);
        flushed.a[0] = self.counters.outstanding();
        self.transmit(flushed)
    }

    fn transmit(&mut self, mut msg: Message) -> Result<(), Error> {
        msg.from = self.me;
        if let Some(flush) = self.flush.as_mut() {
            flush.dirty |= !msg.command.is_control();
        }
        let bytes = msg.encode();
        self.stats.record(msg.command, bytes.len());
        trace!(
            to = msg.to,
            cmd = ?msg.command,
            sender = %msg.sender,
            id = msg.id,
            payload = %msg.payload.hex(),
            "send"
        );
        self.transport.send(Channel::Main, msg.to, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::loopback::Loopback;

    fn msg(command: Command, sender: GlobalId) -> Message {
        let mut msg = Message::new(command, 1);
        msg.sender = sender;
        msg
    }

    #[test]
    fn test_window_holds_messages_until_confirmed() {
        let counters = Counters::default();
        let mut windows = Windows::new();
        let task = GlobalId::direct(0, 7);
        let first = windows.standard(msg(Command::AddPreslot, task), &counters).unwrap();
        assert_eq!(first.id, 1);
        assert!(windows.standard(msg(Command::SatisfyPreslot, task), &counters).is_none());
        assert!(windows.standard(msg(Command::DbData, task), &counters).is_none());
        assert_eq!(counters.unconfirmed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.unsent.load(Ordering::SeqCst), 2);
        assert_eq!(windows.outstanding(), (1, 2));

        // the satisfy goes out, the data message waits behind it
        let released = windows.confirm(task, 1, &counters).unwrap();
        assert_eq!(released.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
        // the data message auto-confirms, so the window drains completely
        let released = windows.confirm(task, 2, &counters).unwrap();
        assert_eq!(released.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(counters.outstanding(), 0);
        assert!(windows.is_empty());
    }

    #[test]
    fn test_auto_confirmed_messages_never_wait() {
        let counters = Counters::default();
        let mut windows = Windows::new();
        let task = GlobalId::direct(0, 7);
        for _ in 0..3 {
            let sent = windows.standard(msg(Command::DbData, task), &counters).unwrap();
            assert_eq!(sent.id, 1);
        }
        assert_eq!(counters.outstanding(), 0);
    }

    #[test]
    fn test_windows_are_independent_per_task() {
        let counters = Counters::default();
        let mut windows = Windows::new();
        let a = GlobalId::direct(0, 7);
        let b = GlobalId::direct(0, 8);
        assert!(windows.standard(msg(Command::EdtCreate, a), &counters).is_some());
        assert!(windows.standard(msg(Command::EdtCreate, b), &counters).is_some());
        assert!(windows.standard(msg(Command::EdtCreate, a), &counters).is_none());
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_out_of_order_confirmation_is_fatal() {
        let counters = Counters::default();
        let mut windows = Windows::new();
        let task = GlobalId::direct(0, 7);
        windows.standard(msg(Command::AddPreslot, task), &counters);
        windows.standard(msg(Command::AddPreslot, task), &counters);
        assert!(matches!(
            windows.confirm(task, 2, &counters),
            Err(Error::ConfirmationOutOfOrder { expected: 1, received: 2, .. })
        ));
        assert!(matches!(
            windows.confirm(GlobalId::direct(0, 9), 1, &counters),
            Err(Error::ConfirmationOutOfOrder { .. })
        ));
    }

    #[tokio::test]
    async fn test_flush_epoch_reports_outstanding() {
        let mut nodes = Loopback::cluster(2).into_iter();
        let (zero, one) = (nodes.next().unwrap(), nodes.next().unwrap());
        let zero: Arc<dyn Transport> = Arc::new(zero);
        let counters = Arc::new(Counters::default());
        let stats = Arc::new(Stats::default());
        let mut sender = SenderLoop::new(0, zero.clone(), counters.clone(), stats.clone());

        let task = GlobalId::direct(0, 7);
        sender.step(SendMode::Standard(msg(Command::AddPreslot, task))).unwrap();
        sender.step(SendMode::StartFlush { origin: 1 }).unwrap();
        sender.step(SendMode::Reflushed).unwrap();
        sender.step(SendMode::Reflushed).unwrap();

        let next = |bytes: Option<Vec<u8>>| Message::decode(&bytes.unwrap()).unwrap();
        assert_eq!(next(one.receive(Channel::Main, 0).await).command, Command::AddPreslot);
        assert_eq!(next(one.receive(Channel::Main, 0).await).command, Command::Flush);
        let flushed = next(one.receive(Channel::Main, 0).await);
        assert_eq!(flushed.command, Command::Flushed);
        assert_eq!(flushed.a[0], 1);
        assert_eq!(next(zero.receive(Channel::Main, 0).await).command, Command::Flush);
        assert_eq!(stats.count(Command::Flush), 2);
    }

    #[test]
    fn test_traffic_during_flush_fails_it() {
        let mut nodes = Loopback::cluster(1);
        let transport: Arc<dyn Transport> = Arc::new(nodes.remove(0));
        let mut sender = SenderLoop::new(
            0,
            transport,
            Arc::new(Counters::default()),
            Arc::new(Stats::default()),
        );
        sender.step(SendMode::StartFlush { origin: 0 }).unwrap();
        let mut data = Message::new(Command::DbData, 0);
        data.sender = GlobalId::direct(0, 3);
        sender.step(SendMode::Standard(data)).unwrap();
        assert!(matches!(
            sender.step(SendMode::Reflushed),
            Err(Error::FlushFailed { node: 0 })
        ));
    }
}
