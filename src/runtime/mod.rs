//! Nodes, their message loops and the application surface.

// Every node is one `Context`. Its messages arrive through one receiver per
// source node and are handled one at a time by the dispatcher, which never
// blocks on a task body: bodies run on blocking threads, bounded by the
// worker semaphore, and talk back to the node through a `Scope`.

// Handlers and task bodies never hold two object locks at once. Whatever a
// data block or vertex decides while locked comes back as effects or
// signals, applied once the lock is gone. This keeps lock acquisition free
// of ordering rules across blocks, tasks and events.

mod api;
mod cluster;
mod context;
mod control;
mod dispatch;

pub use api::Scope;
pub use cluster::Cluster;
pub use context::Context;
