//! Shard Storage Boundary
//!
//! The coordination layer never looks inside a shard. It only needs to:
//!
//! - **Compare** replicas through a [`ShardDigest`] (bit population plus checksum).
//! - **Copy** a replica wholesale as a [`ShardDelta`] and install it elsewhere.
//!
//! [`MemoryShardStore`] keeps one roaring bitmap per shard and backs the binary and
//! the tests.

pub mod memory;


use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::shard::ShardId;

pub use memory::MemoryShardStore;

/// Comparable fingerprint of one replica of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDigest {
    /// Number of set bits.
    pub bits: u64,
    pub checksum: String,
    /// The replica failed its integrity check and must not be used as a source.
    #[serde(default)]
    pub corrupt: bool,
}

impl ShardDigest {
    pub fn new(bits: u64, checksum: impl Into<String>) -> Self {
        Self {
            bits,
            checksum: checksum.into(),
            corrupt: false,
        }
    }

    pub fn corrupt(bits: u64, checksum: impl Into<String>) -> Self {
        Self {
            corrupt: true,
            ..Self::new(bits, checksum)
        }
    }

    /// Replicas are ordered by population, then checksum. The greatest wins a repair.
    pub fn authority_key(&self) -> (u64, &str) {
        (self.bits, self.checksum.as_str())
    }

    /// Same content, as far as digests can tell.
    pub fn matches(&self, other: &ShardDigest) -> bool {
        self.bits == other.bits && self.checksum == other.checksum
    }
}

/// Full snapshot of a shard replica. Applying it replaces the target's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDelta {
    pub bytes: Vec<u8>,
}

/// The storage engine as seen by the repairer and the shard API.
pub trait ShardStore: Send + Sync {
    /// Digest of the local replica. A shard that is not held digests as empty.
    fn digest_of(&self, shard: &ShardId) -> ShardDigest;

    fn export(&self, shard: &ShardId) -> Result<ShardDelta, StoreError>;

    fn apply_delta(&self, shard: &ShardId, delta: &ShardDelta) -> Result<(), StoreError>;

    /// Every shard held locally.
    fn shards(&self) -> Vec<ShardId>;
}
