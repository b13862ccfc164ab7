use serde::{Deserialize, Serialize};

use crate::membership::types::Node;

/// A condition that weakens guarantees without stopping the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthWarning {
    /// Fewer live nodes than the replica factor; every node holds every shard.
    UnderReplicated { replica_n: usize, live: usize },
    /// A peer advertises a different replica factor (split-brain ownership).
    ReplicaFactorDivergence {
        node: String,
        theirs: usize,
        ours: usize,
    },
    /// A resize broadcast did not reach these nodes.
    PartialResize {
        replica_n: usize,
        unreached: Vec<String>,
    },
    /// A peer was refused because it runs another shard width.
    ShardWidthMismatch { node: String, theirs: u32, ours: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub local: Node,
    pub nodes: Vec<Node>,
    pub replica_n: usize,
    pub topology_version: u64,
    pub warnings: Vec<HealthWarning>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}
