//! Rendezvous (highest random weight) placement.
//!
//! Every node gets a weight per shard; the `N` heaviest nodes own the shard. A node
//! joining or leaving only changes the owner set of shards it is (or becomes) part
//! of. Weights use CRC-32 and a fixed mixer so they agree across platforms and builds.

use crate::membership::types::Node;

const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

/// Owners of `shard`, heaviest first. Returns `min(replica_n, nodes.len())` nodes.
///
/// `nodes` must not contain duplicates.
pub fn owners_of(shard: u64, nodes: &[Node], replica_n: usize) -> Vec<Node> {
    let mut weighted: Vec<(u64, &Node)> = nodes
        .iter()
        .map(|node| (weight(shard, &node.host), node))
        .collect();

    weighted.sort_by(|(wa, a), (wb, b)| wb.cmp(wa).then_with(|| a.host.cmp(&b.host)));

    weighted
        .into_iter()
        .take(replica_n)
        .map(|(_, node)| node.clone())
        .collect()
}

fn weight(shard: u64, host: &str) -> u64 {
    let host_hash = crc32fast::hash(host.as_bytes()) as u64;
    mix64(mix64(shard) ^ host_hash.wrapping_mul(GOLDEN))
}

/// splitmix64 finalizer.
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
