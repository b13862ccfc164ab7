//! Shard Mapping
//!
//! The logical column space is cut into shards of `2^E` columns. Shard boundaries are
//! computed with shifts, so every node in a cluster must agree on `E`; the exponent is
//! advertised in join and gossip messages and checked there.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::error::ConfigError;

pub const MIN_SHARD_WIDTH: u32 = 16;
pub const MAX_SHARD_WIDTH: u32 = 32;
pub const DEFAULT_SHARD_WIDTH: u32 = 24;

/// Shard-width exponent `E`. Always within `16..=32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ShardWidth(u32);

impl ShardWidth {
    pub fn new(exponent: u32) -> Result<Self, ConfigError> {
        if !(MIN_SHARD_WIDTH..=MAX_SHARD_WIDTH).contains(&exponent) {
            return Err(ConfigError::ShardWidthOutOfRange(exponent));
        }
        Ok(Self(exponent))
    }

    pub fn exponent(self) -> u32 {
        self.0
    }

    /// Number of columns in one shard.
    pub fn columns(self) -> u64 {
        1u64 << self.0
    }

    pub fn shard_of(self, column: u64) -> u64 {
        column >> self.0
    }

    /// Columns covered by `shard`, both ends included. A shard past the last one the
    /// column space can hold covers nothing.
    pub fn shard_range(self, shard: u64) -> RangeInclusive<u64> {
        if shard > u64::MAX >> self.0 {
            return RangeInclusive::new(1, 0);
        }
        let start = shard << self.0;
        start..=start | (self.columns() - 1)
    }

    /// Position of `column` inside its shard. Fits in `u32` because `E <= 32`.
    pub fn offset_in_shard(self, column: u64) -> u32 {
        (column & (self.columns() - 1)) as u32
    }
}

impl Default for ShardWidth {
    fn default() -> Self {
        Self(DEFAULT_SHARD_WIDTH)
    }
}

impl TryFrom<u32> for ShardWidth {
    type Error = ConfigError;

    fn try_from(exponent: u32) -> Result<Self, Self::Error> {
        Self::new(exponent)
    }
}

impl From<ShardWidth> for u32 {
    fn from(width: ShardWidth) -> u32 {
        width.0
    }
}

impl fmt::Display for ShardWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "2^{}", self.0)
    }
}

/// Full identity of a replicated unit of storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub field: String,
    pub shard: u64,
}

impl ShardId {
    pub fn new(index: impl Into<String>, field: impl Into<String>, shard: u64) -> Self {
        Self {
            index: index.into(),
            field: field.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.index, self.field, self.shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_width_boundaries() {
        let width = ShardWidth::default();

        assert_eq!(width.shard_of(16_777_215), 0);
        assert_eq!(width.shard_of(16_777_216), 1);
        assert_eq!(width.shard_of(0), 0);
    }

    #[test]
    fn test_same_shard_within_range() {
        let width = ShardWidth::new(20).unwrap();
        let range = width.shard_range(5);
        let (start, end) = (*range.start(), *range.end());

        for column in [start, start + 1, start + (end - start) / 2, end] {
            assert_eq!(width.shard_of(column), 5);
        }
        assert_eq!(width.shard_of(end + 1), 6);
        assert_eq!(end - start + 1, width.columns());
    }

    #[test]
    fn test_adjacent_shards_differ_by_one() {
        for exponent in MIN_SHARD_WIDTH..=MAX_SHARD_WIDTH {
            let width = ShardWidth::new(exponent).unwrap();
            for shard in [0u64, 1, 7, 1000] {
                let end = *width.shard_range(shard).end();
                assert_eq!(width.shard_of(end) + 1, width.shard_of(end + 1));
            }
        }
    }

    #[test]
    fn test_last_shard_holds_max_column() {
        for exponent in MIN_SHARD_WIDTH..=MAX_SHARD_WIDTH {
            let width = ShardWidth::new(exponent).unwrap();
            let last = width.shard_of(u64::MAX);

            assert!(width.shard_range(last).contains(&u64::MAX));
            assert_eq!(*width.shard_range(last).end(), u64::MAX);
            assert!(width.shard_range(last + 1).is_empty());
        }
    }

    #[test]
    fn test_monotonic() {
        let width = ShardWidth::new(16).unwrap();
        let mut previous = 0;
        for column in (0..5_000_000u64).step_by(997) {
            let shard = width.shard_of(column);
            assert!(shard >= previous);
            previous = shard;
        }
    }

    #[test]
    fn test_total_for_max_column() {
        let width = ShardWidth::new(32).unwrap();
        assert_eq!(width.shard_of(u64::MAX), u32::MAX as u64);
        assert_eq!(width.offset_in_shard(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_offset_in_shard() {
        let width = ShardWidth::default();
        assert_eq!(width.offset_in_shard(16_777_216 + 42), 42);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(ShardWidth::new(15).is_err());
        assert!(ShardWidth::new(33).is_err());
        assert!(ShardWidth::new(16).is_ok());
        assert!(ShardWidth::new(32).is_ok());
    }

    #[test]
    fn test_width_serde_validates() {
        let width: ShardWidth = serde_json::from_str("20").unwrap();
        assert_eq!(width.exponent(), 20);
        assert!(serde_json::from_str::<ShardWidth>("40").is_err());
    }
}
