use std::{
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use rand::Rng;
use typed_builder::TypedBuilder;

use crate::id::NodeId;

/// How a task created without an explicit affinity hint picks its node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AffinityPolicy {
    /// Run on the creating node.
    #[default]
    Local,
    /// Cycle through all nodes, starting after the creating node.
    RoundRobin,
    /// Pick a node uniformly at random.
    Random,
}

impl AffinityPolicy {
    pub(crate) fn pick(
        self,
        me: NodeId,
        node_count: u32,
        cursor: &AtomicU32,
    ) -> NodeId {
        match self {
            AffinityPolicy::Local => me,
            AffinityPolicy::RoundRobin => {
                let step = cursor.fetch_add(1, Ordering::Relaxed);
                ((u64::from(me) + 1 + u64::from(step)) % u64::from(node_count)) as NodeId
            }
            AffinityPolicy::Random => rand::thread_rng().gen_range(0..node_count),
        }
    }
}

/// Cluster-wide settings. Every node of a cluster shares one `Config`.
#[derive(TypedBuilder, Clone, Debug)]
pub struct Config {
    /// Number of nodes in the cluster.
    #[builder(default = 1)]
    pub nodes: u32,
    /// Task bodies allowed to run at once on each node.
    #[builder(default = 4)]
    pub workers: usize,
    /// Size of the id range reserved from a remote node in one exchange.
    #[builder(default = 128)]
    pub preallocate_count: u32,
    #[builder(default)]
    pub affinity: AffinityPolicy,
    /// Where `save` writes and `load` reads per-node checkpoints.
    #[builder(default = std::env::temp_dir().join("weft"), setter(into))]
    pub checkpoint_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder().nodes(3).build();
        assert_eq!(config.nodes, 3);
        assert_eq!(config.workers, 4);
        assert_eq!(config.preallocate_count, 128);
        assert_eq!(config.affinity, AffinityPolicy::Local);
    }

    #[test]
    fn test_round_robin_skips_nothing() {
        let cursor = AtomicU32::new(0);
        let picked: Vec<_> = (0..4)
            .map(|_| AffinityPolicy::RoundRobin.pick(1, 4, &cursor))
            .collect();
        assert_eq!(picked, vec![2, 3, 0, 1]);
    }

    #[test]
    fn test_round_robin_survives_cursor_wrap() {
        let cursor = AtomicU32::new(u32::MAX - 1);
        let picked: Vec<_> = (0..3)
            .map(|_| AffinityPolicy::RoundRobin.pick(1, 4, &cursor))
            .collect();
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn test_random_stays_in_range() {
        let cursor = AtomicU32::new(0);
        for _ in 0..64 {
            assert!(AffinityPolicy::Random.pick(0, 3, &cursor) < 3);
        }
    }
}
