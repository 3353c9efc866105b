use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc, Mutex};

use super::transport::{Channel, Transport};
use crate::{error::Error, id::NodeId};

type Inbound = Mutex<mpsc::UnboundedReceiver<Vec<u8>>>;

/// In-process transport: one unbounded channel per ordered node pair and
/// channel kind.
pub struct Loopback {
    me: NodeId,
    outbound: [Vec<mpsc::UnboundedSender<Vec<u8>>>; 2],
    inbound: [Vec<Inbound>; 2],
}

impl Loopback {
    /// Endpoints for a fully connected cluster of `nodes`, indexed by node.
    pub fn cluster(nodes: u32) -> Vec<Loopback> {
        let n = nodes as usize;
        let mut endpoints: Vec<Loopback> = (0..nodes)
            .map(|me| Loopback {
                me,
                outbound: [Vec::with_capacity(n), Vec::with_capacity(n)],
                inbound: [Vec::with_capacity(n), Vec::with_capacity(n)],
            })
            .collect();
        for channel in 0..2 {
            // indexed [to][from]
            let mut receivers: Vec<Vec<Option<Inbound>>> =
                (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
            for from in 0..n {
                for to in 0..n {
                    let (tx, rx) = mpsc::unbounded_channel();
                    endpoints[from].outbound[channel].push(tx);
                    receivers[to][from] = Some(Mutex::new(rx));
                }
            }
            for (to, row) in receivers.into_iter().enumerate() {
                endpoints[to].inbound[channel] = row.into_iter().flatten().collect();
            }
        }
        endpoints
    }

    pub fn me(&self) -> NodeId {
        self.me
    }
}

impl Transport for Loopback {
    fn node_count(&self) -> u32 {
        self.outbound[0].len() as u32
    }

    fn send(&self, channel: Channel, to: NodeId, bytes: Vec<u8>) -> Result<(), Error> {
        self.outbound[channel as usize]
            .get(to as usize)
            .ok_or(Error::InvalidArgument("destination node out of range"))?
            .send(bytes)?;
        Ok(())
    }

    fn receive(&self, channel: Channel, from: NodeId) -> BoxFuture<'_, Option<Vec<u8>>> {
        async move {
            let inbound = self.inbound[channel as usize].get(from as usize)?;
            inbound.lock().await.recv().await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_is_fifo_per_pair() {
        let nodes = Loopback::cluster(3);
        assert_eq!(nodes[1].node_count(), 3);
        for i in 0u8..4 {
            nodes[0].send(Channel::Main, 2, vec![i]).unwrap();
        }
        nodes[1].send(Channel::Main, 2, vec![9]).unwrap();
        nodes[0].send(Channel::Fetch, 2, vec![7]).unwrap();
        for i in 0u8..4 {
            assert_eq!(nodes[2].receive(Channel::Main, 0).await, Some(vec![i]));
        }
        assert_eq!(nodes[2].receive(Channel::Main, 1).await, Some(vec![9]));
        assert_eq!(nodes[2].receive(Channel::Fetch, 0).await, Some(vec![7]));
    }

    #[tokio::test]
    async fn test_self_delivery() {
        let nodes = Loopback::cluster(1);
        nodes[0].send(Channel::Main, 0, vec![1, 2]).unwrap();
        assert_eq!(nodes[0].receive(Channel::Main, 0).await, Some(vec![1, 2]));
        assert!(nodes[0].send(Channel::Main, 5, vec![]).is_err());
    }
}
