//! Shared cluster state: the published topology snapshot and the schema.
//!
//! The topology is never mutated in place. Every membership change builds a new
//! [`Topology`] and swaps the pointer, so a reader holding an `Arc<Topology>`
//! always computes ownership against one consistent node list.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::placement;
use crate::broadcast::types::ClusterEvent;
use crate::membership::types::Node;
use crate::shard::{ShardId, ShardWidth};

/// Immutable view of the cluster used for ownership computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Sorted by host, no duplicates.
    pub nodes: Vec<Node>,
    pub replica_n: usize,
    /// Bumped on every publish.
    pub version: u64,
}

impl Topology {
    pub fn new(mut nodes: Vec<Node>, replica_n: usize) -> Self {
        nodes.sort();
        nodes.dedup();
        Self {
            nodes,
            replica_n,
            version: 0,
        }
    }

    pub fn owners_of(&self, shard: u64) -> Vec<Node> {
        placement::owners_of(shard, &self.nodes, self.replica_n)
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.binary_search(node).is_ok()
    }

    pub fn is_under_replicated(&self) -> bool {
        self.replica_n > self.nodes.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexInfo {
    pub fields: BTreeSet<String>,
    /// Highest shard announced for this index, if any.
    pub max_shard: Option<u64>,
}

/// Index and field names plus the highest shard per index.
#[derive(Debug, Default)]
pub struct Schema {
    indexes: DashMap<String, IndexInfo>,
}

impl Schema {
    pub fn create_index(&self, index: &str) -> bool {
        if self.indexes.contains_key(index) {
            return false;
        }
        self.indexes.insert(index.to_string(), IndexInfo::default());
        true
    }

    pub fn delete_index(&self, index: &str) -> bool {
        self.indexes.remove(index).is_some()
    }

    pub fn create_field(&self, index: &str, field: &str) -> bool {
        self.indexes
            .entry(index.to_string())
            .or_default()
            .fields
            .insert(field.to_string())
    }

    pub fn delete_field(&self, index: &str, field: &str) -> bool {
        self.indexes
            .get_mut(index)
            .map(|mut info| info.fields.remove(field))
            .unwrap_or(false)
    }

    pub fn create_shard(&self, index: &str, shard: u64) -> bool {
        let mut info = self.indexes.entry(index.to_string()).or_default();
        match info.max_shard {
            Some(max) if max >= shard => false,
            _ => {
                info.max_shard = Some(shard);
                true
            }
        }
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indexes.contains_key(index)
    }

    pub fn index(&self, index: &str) -> Option<IndexInfo> {
        self.indexes.get(index).map(|info| info.clone())
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Every `(index, field, shard)` up to each index's highest shard.
    pub fn shards(&self) -> Vec<ShardId> {
        self.shards_where(|_| true)
    }

    /// Like [`Schema::shards`], keeping only shard numbers accepted by `keep`.
    ///
    /// `keep` is asked once per shard number of an index, before any id is built, so
    /// the result only grows with the shards that pass.
    pub fn shards_where(&self, keep: impl Fn(u64) -> bool) -> Vec<ShardId> {
        let indexes: Vec<(String, Vec<String>, u64)> = self
            .indexes
            .iter()
            .filter_map(|entry| {
                let max_shard = entry.max_shard?;
                let fields = entry.fields.iter().cloned().collect();
                Some((entry.key().clone(), fields, max_shard))
            })
            .collect();

        let mut shards = Vec::new();
        for (index, fields, max_shard) in indexes {
            if fields.is_empty() {
                continue;
            }
            for shard in (0..=max_shard).filter(|shard| keep(*shard)) {
                for field in &fields {
                    shards.push(ShardId::new(index.clone(), field.clone(), shard));
                }
            }
        }
        shards.sort();
        shards
    }
}

/// State shared by the cluster facade, the broadcasters and the API handlers.
pub struct ClusterState {
    local: Node,
    shard_width: ShardWidth,
    topology: RwLock<Arc<Topology>>,
    schema: Schema,
}

impl ClusterState {
    pub fn new(
        local: Node,
        nodes: Vec<Node>,
        replica_n: usize,
        shard_width: ShardWidth,
    ) -> Arc<Self> {
        let mut nodes = nodes;
        if !nodes.contains(&local) {
            nodes.push(local.clone());
        }
        Arc::new(Self {
            local,
            shard_width,
            topology: RwLock::new(Arc::new(Topology::new(nodes, replica_n))),
            schema: Schema::default(),
        })
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn shard_width(&self) -> ShardWidth {
        self.shard_width
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Current snapshot. The lock is held only long enough to clone the `Arc`.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    /// Builds the next snapshot from the current one and publishes it. `f` returns
    /// `None` when there is nothing to change.
    fn publish<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Topology) -> Option<Topology>,
    {
        let mut slot = self.topology.write();
        match f(&slot) {
            Some(mut next) => {
                next.version = slot.version + 1;
                *slot = Arc::new(next);
                true
            }
            None => false,
        }
    }

    /// Applies an event and reports whether anything changed.
    pub fn apply(&self, event: &ClusterEvent) -> bool {
        let changed = match event {
            ClusterEvent::NodeJoined { node } => self.publish(|current| {
                if current.contains(node) {
                    return None;
                }
                let mut nodes = current.nodes.clone();
                nodes.push(node.clone());
                Some(Topology::new(nodes, current.replica_n))
            }),
            ClusterEvent::NodeLeft { node } => {
                if *node == self.local {
                    tracing::warn!("Ignoring report that the local node {} left", node);
                    return false;
                }
                self.publish(|current| {
                    if !current.contains(node) {
                        return None;
                    }
                    let nodes = current.nodes.iter().filter(|n| *n != node).cloned().collect();
                    Some(Topology::new(nodes, current.replica_n))
                })
            }
            ClusterEvent::ClusterResized { replica_n } => {
                if *replica_n == 0 {
                    tracing::warn!("Ignoring resize to zero replicas");
                    return false;
                }
                self.publish(|current| {
                    if current.replica_n == *replica_n {
                        return None;
                    }
                    Some(Topology::new(current.nodes.clone(), *replica_n))
                })
            }
            ClusterEvent::CreateIndex { index } => self.schema.create_index(index),
            ClusterEvent::DeleteIndex { index } => self.schema.delete_index(index),
            ClusterEvent::CreateField { index, field } => self.schema.create_field(index, field),
            ClusterEvent::DeleteField { index, field } => self.schema.delete_field(index, field),
            ClusterEvent::CreateShard { index, shard } => self.schema.create_shard(index, *shard),
        };

        if changed {
            tracing::info!("Applied {} event: {:?}", event.kind(), event);
        } else {
            tracing::debug!("{} event already applied", event.kind());
        }
        changed
    }
}
