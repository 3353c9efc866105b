use std::{
    collections::VecDeque,
    ops::Range,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;
use tracing::trace;

use super::{
    sender::Stats,
    transport::{Channel, Transport},
    wire::{Command, Message},
};
use crate::{
    error::Error,
    id::{GlobalId, NodeId},
};

/// Request/reply traffic on the fetch channel. Replies from one node come
/// back in request order, so each destination keeps a plain queue of
/// waiters.
pub struct Fetcher {
    me: NodeId,
    transport: Arc<dyn Transport>,
    stats: Arc<Stats>,
    pending: Mutex<Vec<VecDeque<oneshot::Sender<Message>>>>,
}

impl Fetcher {
    pub fn new(me: NodeId, transport: Arc<dyn Transport>, stats: Arc<Stats>) -> Self {
        let nodes = transport.node_count() as usize;
        Self {
            me,
            transport,
            stats,
            pending: Mutex::new((0..nodes).map(|_| VecDeque::new()).collect()),
        }
    }

    /// Sends `msg` and waits for the matching reply.
    pub async fn request(&self, mut msg: Message) -> Result<Message, Error> {
        let (tx, rx) = oneshot::channel();
        {
            // queue and send under one lock so the queue order is the wire order
            let mut pending = crate::directory::lock(&self.pending);
            pending
                .get_mut(msg.to as usize)
                .ok_or(Error::InvalidArgument("destination node out of range"))?
                .push_back(tx);
            msg.from = self.me;
            self.transmit(&msg)?;
        }
        Ok(rx.await?)
    }

    /// Answers a request received from `msg.to`.
    pub fn reply(&self, mut msg: Message) -> Result<(), Error> {
        msg.from = self.me;
        self.transmit(&msg)
    }

    /// Hands a reply from `from` to the oldest waiter on that node.
    pub fn complete(&self, from: NodeId, msg: Message) -> Result<(), Error> {
        let waiter = crate::directory::lock(&self.pending)
            .get_mut(from as usize)
            .and_then(VecDeque::pop_front)
            .ok_or(Error::MalformedMessage("fetch reply without a request"))?;
        // the requester may have given up
        let _ = waiter.send(msg);
        Ok(())
    }

    /// Drops every waiter, failing their requests.
    pub fn cancel(&self) {
        for queue in crate::directory::lock(&self.pending).iter_mut() {
            queue.clear();
        }
    }

    /// A description of `id` from its owner.
    pub async fn pull(&self, id: GlobalId, owner: NodeId) -> Result<Message, Error> {
        self.request(Message::pull_object(owner, id)).await
    }

    /// A fresh range of repository slots on `node`.
    pub async fn allocate_guid(&self, node: NodeId) -> Result<Range<u32>, Error> {
        let reply = self.request(Message::allocate_guid(node)).await?;
        expect(&reply, Command::AllocatedGuid)?;
        let first = reply.id_at(0).index();
        Ok(first..first + reply.u32_at(1))
    }

    /// A cluster-unique map id, served by node 0.
    pub async fn allocate_map_id(&self) -> Result<u32, Error> {
        let reply = self.request(Message::allocate_map_id(0)).await?;
        expect(&reply, Command::AllocatedMapId)?;
        Ok(reply.u32_at(0))
    }

    fn transmit(&self, msg: &Message) -> Result<(), Error> {
        let bytes = msg.encode();
        self.stats.record(msg.command, bytes.len());
        trace!(to = msg.to, cmd = ?msg.command, a0 = msg.a[0], "fetch send");
        self.transport.send(Channel::Fetch, msg.to, bytes)
    }
}

fn expect(msg: &Message, command: Command) -> Result<(), Error> {
    if msg.command == command {
        Ok(())
    } else {
        Err(Error::MalformedMessage("unexpected fetch reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::loopback::Loopback;

    #[tokio::test]
    async fn test_replies_match_requests_in_order() {
        let mut nodes = Loopback::cluster(2);
        let one = nodes.pop().unwrap();
        let zero: Arc<dyn Transport> = Arc::new(nodes.pop().unwrap());
        let fetcher = Arc::new(Fetcher::new(0, zero, Arc::new(Stats::default())));

        let first = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.allocate_guid(1).await }
        });
        let request = Message::decode(&one.receive(Channel::Fetch, 0).await.unwrap()).unwrap();
        assert_eq!(request.command, Command::AllocateGuid);
        assert_eq!(request.from, 0);

        let second = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.pull(GlobalId::direct(1, 9), 1).await }
        });
        let request = Message::decode(&one.receive(Channel::Fetch, 0).await.unwrap()).unwrap();
        assert_eq!(request.id_at(0), GlobalId::direct(1, 9));

        fetcher
            .complete(1, Message::allocated_guid(0, GlobalId::direct(1, 40), 8))
            .unwrap();
        fetcher
            .complete(1, Message::push_proxy(0, GlobalId::direct(1, 9), crate::directory::ObjectKind::Event))
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 40..48);
        assert_eq!(second.await.unwrap().unwrap().command, Command::PushProxy);
    }

    #[test]
    fn test_unsolicited_reply_is_rejected() {
        let mut nodes = Loopback::cluster(1);
        let fetcher = Fetcher::new(0, Arc::new(nodes.remove(0)), Arc::new(Stats::default()));
        assert!(fetcher.complete(0, Message::allocated_map_id(0, 1)).is_err());
    }
}
