use std::sync::Arc;

use futures::future::try_join_all;
use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info_span, warn, Instrument};

use super::{
    api::Scope,
    context::{Context, Shared},
    control::Control,
    dispatch,
};
use crate::{
    config::Config,
    error::Error,
    graph::template::Registry,
    id::{GlobalId, NodeId},
    net::{sender::SenderLoop, Command, Counters, Message, SendMode, Stats, Transport},
};

#[cfg(feature = "loopback")]
use crate::net::Loopback;

/// A set of nodes running in this process, one [`Context`] each, wired
/// together by their transports.
pub struct Cluster {
    nodes: Vec<Arc<Context>>,
    shared: Arc<Shared>,
    senders: Vec<JoinHandle<()>>,
    loops: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Starts `config.nodes` nodes connected in-process.
    #[cfg(feature = "loopback")]
    pub fn start(config: Config, registry: Registry) -> Result<Self, Error> {
        let transports = Loopback::cluster(config.nodes)
            .into_iter()
            .map(|endpoint| Arc::new(endpoint) as Arc<dyn Transport>)
            .collect();
        Self::with_transports(config, registry, transports)
    }

    /// Starts one node per transport, indexed by node. Must be called from
    /// within a tokio runtime.
    pub fn with_transports(
        config: Config,
        registry: Registry,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self, Error> {
        if config.nodes == 0 {
            return Err(Error::InvalidArgument("a cluster needs at least one node"));
        }
        if transports.len() != config.nodes as usize {
            return Err(Error::InvalidArgument("one transport per node is required"));
        }
        let runtime = Handle::try_current().map_err(|_| Error::InvalidArgument("no tokio runtime"))?;
        let registry = Arc::new(registry);
        let shared = Arc::new(Shared::new(config.nodes));
        let mut nodes = Vec::with_capacity(transports.len());
        let mut senders = Vec::with_capacity(transports.len());
        let mut loops = Vec::new();

        for (me, transport) in transports.into_iter().enumerate() {
            let me = me as NodeId;
            let counters = Arc::new(Counters::default());
            let stats = Arc::new(Stats::default());
            let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
            let ctx = Arc::new(Context::new(
                me,
                config.clone(),
                registry.clone(),
                transport.clone(),
                outgoing,
                counters.clone(),
                stats.clone(),
                shared.clone(),
                runtime.clone(),
            ));

            let sender = SenderLoop::new(me, transport, counters, stats);
            senders.push(runtime.spawn({
                let ctx = ctx.clone();
                async move {
                    if let Err(e) = sender.run(outgoing_rx).await {
                        ctx.fatal(e);
                    }
                }
            }));

            let (inbound, inbound_rx) = mpsc::unbounded_channel();
            loops.push(runtime.spawn(dispatch::dispatch(ctx.clone(), inbound_rx)));
            for from in 0..config.nodes {
                loops.push(runtime.spawn(dispatch::receive(ctx.clone(), from, inbound.clone())));
                loops.push(runtime.spawn(dispatch::serve_fetch(ctx.clone(), from)));
            }
            nodes.push(ctx);
        }
        debug!(nodes = config.nodes, workers = config.workers, "cluster started");
        Ok(Self { nodes, shared, senders, loops })
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn context(&self, node: NodeId) -> Result<&Arc<Context>, Error> {
        self.nodes
            .get(node as usize)
            .ok_or(Error::InvalidArgument("node out of range"))
    }

    pub fn stats(&self, node: NodeId) -> Result<&Stats, Error> {
        Ok(self.context(node)?.stats())
    }

    /// Runs `main` on node 0 and waits until every node has seen
    /// `shutdown`. Returns the first fatal error of any node.
    pub async fn run<F>(&self, main: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Scope<'_>) -> Result<(), Error> + Send + 'static,
    {
        let launched = self.exec(0, main)?;
        tokio::select! {
            result = launched => result.map_err(|_| Error::TaskPanicked(GlobalId::NULL))??,
            error = self.shared.failed() => return Err(error),
        }
        self.wait().await
    }

    /// Runs launching code on `node`, on a blocking thread.
    pub fn exec<F>(&self, node: NodeId, f: F) -> Result<JoinHandle<Result<(), Error>>, Error>
    where
        F: FnOnce(&mut Scope<'_>) -> Result<(), Error> + Send + 'static,
    {
        let ctx = self.context(node)?.clone();
        let span = info_span!("launcher", node);
        Ok(tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let sender = ctx.repository.preallocate_object();
            let mut scope = Scope::launcher(&ctx, sender);
            f(&mut scope)
        }))
    }

    /// Until every node has seen `shutdown`, or the first fatal error.
    pub async fn wait(&self) -> Result<(), Error> {
        self.shared.wait().await
    }

    fn broadcast(&self, command: Command) -> Result<(), Error> {
        let root = &self.nodes[0];
        for node in 0..self.node_count() {
            root.post(SendMode::Direct(Message::control(command, node)))?;
        }
        Ok(())
    }

    /// Sends `command` to every node and waits for each to answer with
    /// `reply`.
    async fn round(
        &self,
        replies: &mut mpsc::UnboundedReceiver<Message>,
        command: Command,
        reply: Command,
    ) -> Result<Vec<Message>, Error> {
        self.broadcast(command)?;
        tokio::select! {
            collected = Control::collect(replies, reply, self.node_count()) => collected,
            error = self.shared.failed() => Err(error),
        }
    }

    async fn pause_with(&self, replies: &mut mpsc::UnboundedReceiver<Message>) -> Result<u64, Error> {
        self.round(replies, Command::Pause, Command::Paused).await?;
        let flushed = self.round(replies, Command::StartFlush, Command::Flushed).await?;
        let outstanding = flushed.iter().map(|msg| msg.a[0]).sum();
        debug!(outstanding, "cluster paused");
        Ok(outstanding)
    }

    /// Stops every node once its running task bodies return and checks
    /// that no graph traffic is moving. Returns the number of messages
    /// still waiting for a confirmation or to be sent.
    pub async fn pause(&self) -> Result<u64, Error> {
        let mut replies = self.nodes[0].control.replies.lock().await;
        self.pause_with(&mut replies).await
    }

    /// Respawns parked tasks and replays parked messages.
    pub fn resume(&self) -> Result<(), Error> {
        debug!("cluster resumed");
        self.broadcast(Command::Resume)
    }

    /// Pauses the cluster and writes one checkpoint per node. The cluster
    /// stays paused. Returns the outstanding message count at the time of
    /// the checkpoint.
    pub async fn save(&self) -> Result<u64, Error> {
        let mut replies = self.nodes[0].control.replies.lock().await;
        let outstanding = self.pause_with(&mut replies).await?;
        self.round(&mut replies, Command::Save, Command::Saved).await?;
        Ok(outstanding)
    }

    /// Pauses the cluster and replaces every node's state with its last
    /// checkpoint. The cluster stays paused.
    pub async fn load(&self) -> Result<(), Error> {
        let mut replies = self.nodes[0].control.replies.lock().await;
        self.pause_with(&mut replies).await?;
        self.round(&mut replies, Command::Load, Command::Loaded).await?;
        Ok(())
    }

    /// Waits until every node has reached the barrier.
    pub async fn barrier(&self) -> Result<(), Error> {
        try_join_all(self.nodes.iter().map(|ctx| ctx.barrier())).await?;
        Ok(())
    }

    /// Stops every loop. Loops of a failed cluster are aborted rather than
    /// drained.
    pub async fn stop(self) -> Result<(), Error> {
        self.shared.stop();
        for ctx in &self.nodes {
            if ctx.post(SendMode::Stop).is_err() {
                warn!(node = ctx.me(), "sender loop already gone");
            }
            ctx.fetcher.cancel();
        }
        async {
            for sender in self.senders {
                let _ = sender.await;
            }
            if self.shared.is_failed() {
                for handle in &self.loops {
                    handle.abort();
                }
            }
            for handle in self.loops {
                let _ = handle.await;
            }
        }
        .instrument(info_span!("stop"))
        .await;
        debug!("cluster stopped");
        Ok(())
    }
}
