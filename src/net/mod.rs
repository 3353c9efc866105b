//! Node-to-node messaging.
//!
//! Every message a node sends to another goes through one sender loop per
//! node, which keeps a confirmation window per sending task: the next
//! message of a task leaves only once the previous one has been confirmed
//! by its receiver. Object fetches and id allocation travel on a separate
//! channel that never waits on those windows.

pub mod fetch;
#[cfg(any(test, feature = "loopback"))]
mod loopback;
pub mod sender;
pub mod transport;
pub mod wire;

pub use fetch::Fetcher;
pub use sender::{Counters, SendMode, Stats, Windows};
#[cfg(feature = "loopback")]
pub use loopback::Loopback;
pub use transport::{Channel, Transport};
pub use wire::{Command, Confirmation, Message};
