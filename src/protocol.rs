//! Internal HTTP Protocol
//!
//! Endpoints and DTOs for node-to-node calls: membership registration, event
//! delivery and the anti-entropy shard RPCs. Bodies are JSON.

use serde::{Deserialize, Serialize};

use crate::membership::types::Node;

// --- API Endpoints ---

/// Registers the caller with the receiving node (HTTP membership).
pub const ENDPOINT_JOIN: &str = "/internal/cluster/join";
/// Delivers one broadcast event envelope.
pub const ENDPOINT_MESSAGE: &str = "/internal/cluster/message";
/// Current topology node list.
pub const ENDPOINT_NODES: &str = "/internal/cluster/nodes";
/// Health report with topology warnings.
pub const ENDPOINT_HEALTH: &str = "/internal/cluster/health";
/// Prefix for shard RPCs: `/internal/shards/{index}/{field}/{shard}`.
pub const ENDPOINT_SHARDS: &str = "/internal/shards";

pub fn shard_path(index: &str, field: &str, shard: u64) -> String {
    format!("{}/{}/{}/{}", ENDPOINT_SHARDS, index, field, shard)
}

pub fn digest_path(index: &str, field: &str, shard: u64) -> String {
    format!("{}/digest", shard_path(index, field, shard))
}

// --- Data Transfer Objects ---

/// Sent by a node joining through HTTP membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node: Node,
    pub shard_width: u32,
    pub replica_n: usize,
}

/// Answer to a join. `accepted` is false on a shard-width mismatch; `nodes` is the
/// receiver's view of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub accepted: bool,
    pub shard_width: u32,
    pub nodes: Vec<Node>,
}
