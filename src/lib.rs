//! A distributed task runtime: tasks wired by events and data blocks,
//! spread over a cluster of nodes that exchange confirmed messages.

pub mod block;
pub mod checkpoint;
pub mod config;
pub mod directory;
pub mod error;
pub mod graph;
mod hex;
pub mod id;
pub mod net;
pub mod runtime;

pub use block::{AccessMode, Buffer};
pub use config::{AffinityPolicy, Config};
pub use error::{Error, ErrorCode};
pub use graph::{event::EventKind, properties, template::Registry, Dependency, PARAM_DEF};
pub use id::GlobalId;
pub use runtime::{Cluster, Scope};
