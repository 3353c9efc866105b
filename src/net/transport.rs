use futures::future::BoxFuture;

use crate::{error::Error, id::NodeId};

/// The two independent streams between every pair of nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Confirmed task-graph traffic and control.
    Main = 0,
    /// Object pulls and id allocation.
    Fetch = 1,
}

/// A reliable byte transport, FIFO per source, destination and channel.
pub trait Transport: Send + Sync + 'static {
    fn node_count(&self) -> u32;

    fn send(&self, channel: Channel, to: NodeId, bytes: Vec<u8>) -> Result<(), Error>;

    /// The next message from `from`, or `None` once that stream is closed.
    fn receive(&self, channel: Channel, from: NodeId) -> BoxFuture<'_, Option<Vec<u8>>>;
}
