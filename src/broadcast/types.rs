use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::membership::types::Node;

/// A cluster-wide change. Every variant is idempotent to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    NodeJoined { node: Node },
    NodeLeft { node: Node },
    ClusterResized { replica_n: usize },
    CreateIndex { index: String },
    DeleteIndex { index: String },
    CreateField { index: String, field: String },
    DeleteField { index: String, field: String },
    /// Raises the highest known shard of `index` to at least `shard`.
    CreateShard { index: String, shard: u64 },
}

impl ClusterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::NodeJoined { .. } => "node_joined",
            ClusterEvent::NodeLeft { .. } => "node_left",
            ClusterEvent::ClusterResized { .. } => "cluster_resized",
            ClusterEvent::CreateIndex { .. } => "create_index",
            ClusterEvent::DeleteIndex { .. } => "delete_index",
            ClusterEvent::CreateField { .. } => "create_field",
            ClusterEvent::DeleteField { .. } => "delete_field",
            ClusterEvent::CreateShard { .. } => "create_shard",
        }
    }
}

/// An event on the wire. `id` lets receivers drop gossip retransmissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub origin: String,
    pub event: ClusterEvent,
}

impl EventEnvelope {
    pub fn new(origin: impl Into<String>, event: ClusterEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            event,
        }
    }
}

/// Outcome of a fan-out. Gossip delivery is never observed directly, so it reports
/// `eventual` with both lists empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub reached: Vec<Node>,
    pub unreached: Vec<Node>,
    pub eventual: bool,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.unreached.is_empty()
    }
}
