use dashmap::{DashMap, DashSet};
use roaring::RoaringBitmap;

use super::{ShardDelta, ShardDigest, ShardStore};
use crate::error::StoreError;
use crate::shard::{ShardId, ShardWidth};

/// In-memory bitmap storage: one roaring bitmap of in-shard offsets per shard.
pub struct MemoryShardStore {
    shard_width: ShardWidth,
    shards: DashMap<ShardId, RoaringBitmap>,
    corrupt: DashSet<ShardId>,
}

impl MemoryShardStore {
    pub fn new(shard_width: ShardWidth) -> Self {
        Self {
            shard_width,
            shards: DashMap::new(),
            corrupt: DashSet::new(),
        }
    }

    pub fn shard_width(&self) -> ShardWidth {
        self.shard_width
    }

    fn locate(&self, index: &str, field: &str, column: u64) -> (ShardId, u32) {
        let shard = self.shard_width.shard_of(column);
        (
            ShardId::new(index, field, shard),
            self.shard_width.offset_in_shard(column),
        )
    }

    /// Sets a bit. Returns false if it was already set.
    pub fn set_bit(&self, index: &str, field: &str, column: u64) -> bool {
        let (id, offset) = self.locate(index, field, column);
        self.shards.entry(id).or_default().insert(offset)
    }

    pub fn clear_bit(&self, index: &str, field: &str, column: u64) -> bool {
        let (id, offset) = self.locate(index, field, column);
        self.shards
            .get_mut(&id)
            .map(|mut bitmap| bitmap.remove(offset))
            .unwrap_or(false)
    }

    pub fn contains(&self, index: &str, field: &str, column: u64) -> bool {
        let (id, offset) = self.locate(index, field, column);
        self.shards
            .get(&id)
            .map(|bitmap| bitmap.contains(offset))
            .unwrap_or(false)
    }

    pub fn count(&self, shard: &ShardId) -> u64 {
        self.shards.get(shard).map(|bitmap| bitmap.len()).unwrap_or(0)
    }

    /// Flags a replica as failing its integrity check until it is overwritten.
    pub fn mark_corrupt(&self, shard: &ShardId) {
        tracing::warn!("Shard {} marked corrupt", shard);
        self.corrupt.insert(shard.clone());
    }
}

fn encode(bitmap: &RoaringBitmap) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    // Writing into a Vec cannot fail.
    let _ = bitmap.serialize_into(&mut bytes);
    bytes
}

fn digest(bitmap: &RoaringBitmap) -> ShardDigest {
    let checksum = crc32fast::hash(&encode(bitmap));
    ShardDigest::new(bitmap.len(), format!("{:08x}", checksum))
}

impl ShardStore for MemoryShardStore {
    fn digest_of(&self, shard: &ShardId) -> ShardDigest {
        let mut result = match self.shards.get(shard) {
            Some(bitmap) => digest(&bitmap),
            None => digest(&RoaringBitmap::new()),
        };
        result.corrupt = self.corrupt.contains(shard);
        result
    }

    fn export(&self, shard: &ShardId) -> Result<ShardDelta, StoreError> {
        if self.corrupt.contains(shard) {
            return Err(StoreError::Corrupt(shard.to_string()));
        }
        let bytes = match self.shards.get(shard) {
            Some(bitmap) => encode(&bitmap),
            None => encode(&RoaringBitmap::new()),
        };
        Ok(ShardDelta { bytes })
    }

    fn apply_delta(&self, shard: &ShardId, delta: &ShardDelta) -> Result<(), StoreError> {
        let bitmap = RoaringBitmap::deserialize_from(&delta.bytes[..])
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", shard, e)))?;

        tracing::debug!("Installing {} bits into shard {}", bitmap.len(), shard);
        self.shards.insert(shard.clone(), bitmap);
        self.corrupt.remove(shard);
        Ok(())
    }

    fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.shards.iter().map(|e| e.key().clone()).collect();
        shards.sort();
        shards
    }
}
