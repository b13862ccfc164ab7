//! Anti-Entropy Module
//!
//! Background reconciliation of shard replicas. Each cycle walks the shards this node
//! co-owns, compares the digests of every owner and copies the authoritative replica
//! over the ones that differ.
//!
//! ## Authority rule
//! Corrupt digests are never a source. Among the rest, the greatest
//! `(bit population, checksum)` wins: a fuller replica beats an emptier one, and equal
//! populations fall back to the checksum so every node picks the same winner. When
//! every replica is corrupt the shard is reported as a conflict and left alone.
//!
//! ## Failure semantics
//! A peer that does not answer within the peer timeout makes the shard skip this
//! cycle; nothing ever fails the whole cycle.

pub mod client;
pub mod repairer;


use serde::{Deserialize, Serialize};

use crate::membership::types::Node;
use crate::storage::ShardDigest;

pub use client::{HttpReplicaClient, ReplicaClient};
pub use repairer::Repairer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairPhase {
    Idle,
    Scanning,
    Comparing,
    Repairing,
}

impl RepairPhase {
    fn as_u8(self) -> u8 {
        match self {
            RepairPhase::Idle => 0,
            RepairPhase::Scanning => 1,
            RepairPhase::Comparing => 2,
            RepairPhase::Repairing => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RepairPhase::Scanning,
            2 => RepairPhase::Comparing,
            3 => RepairPhase::Repairing,
            _ => RepairPhase::Idle,
        }
    }
}

/// What to do with one shard after comparing its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    InSync,
    /// No usable replica: needs an operator.
    Conflict,
    Repair { authority: Node, targets: Vec<Node> },
}

pub fn choose_authority(digests: &[(Node, ShardDigest)]) -> Decision {
    let best = digests
        .iter()
        .filter(|(_, digest)| !digest.corrupt)
        .max_by(|(_, a), (_, b)| a.authority_key().cmp(&b.authority_key()));

    let Some((authority, best)) = best else {
        return Decision::Conflict;
    };

    let targets: Vec<Node> = digests
        .iter()
        .filter(|(_, digest)| digest.corrupt || !digest.matches(best))
        .map(|(node, _)| node.clone())
        .collect();

    if targets.is_empty() {
        Decision::InSync
    } else {
        Decision::Repair {
            authority: authority.clone(),
            targets,
        }
    }
}

/// Counters for one repair cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub scanned: usize,
    pub compared: usize,
    pub in_sync: usize,
    pub repaired: usize,
    pub skipped: usize,
    pub conflicts: usize,
    /// Replicas overwritten with the authoritative snapshot.
    pub transfers: usize,
    pub failed: usize,
}
