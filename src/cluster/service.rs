use parking_lot::Mutex;
use std::sync::Arc;

use super::health::{HealthReport, HealthWarning};
use super::state::{ClusterState, Topology};
use crate::broadcast::Broadcaster;
use crate::broadcast::types::{BroadcastReport, ClusterEvent};
use crate::error::{ClusterError, MembershipError};
use crate::membership::NodeSet;
use crate::membership::types::Node;
use crate::shard::{ShardId, ShardWidth};

/// The node's view of the cluster.
///
/// Queries read the current topology snapshot. Mutations are applied locally first
/// and then handed to the broadcaster, so this node never waits on the network to
/// see its own change.
pub struct Cluster {
    state: Arc<ClusterState>,
    node_set: Arc<dyn NodeSet>,
    broadcaster: Arc<dyn Broadcaster>,
    hazards: Mutex<Vec<HealthWarning>>,
}

impl Cluster {
    pub fn new(
        state: Arc<ClusterState>,
        node_set: Arc<dyn NodeSet>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            state,
            node_set,
            broadcaster,
            hazards: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn node_set(&self) -> &Arc<dyn NodeSet> {
        &self.node_set
    }

    pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
        &self.broadcaster
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.state.topology()
    }

    pub fn local_node(&self) -> Node {
        self.state.local().clone()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.topology().nodes.clone()
    }

    pub fn replica_factor(&self) -> usize {
        self.topology().replica_n
    }

    pub fn shard_width(&self) -> ShardWidth {
        self.state.shard_width()
    }

    pub fn shard_of(&self, column: u64) -> u64 {
        self.shard_width().shard_of(column)
    }

    pub fn contains_node(&self, node: &Node) -> bool {
        self.topology().contains(node)
    }

    /// Owners of `shard`, highest weight first.
    pub fn owners_of(&self, shard: u64) -> Vec<Node> {
        self.topology().owners_of(shard)
    }

    pub fn shard_owners(&self, shard: &ShardId) -> Vec<Node> {
        self.owners_of(shard.shard)
    }

    pub fn owns_shard(&self, node: &Node, shard: u64) -> bool {
        self.owners_of(shard).contains(node)
    }

    /// Keeps the shards this node co-owns, against a single snapshot.
    pub fn local_shards(&self, shards: impl IntoIterator<Item = ShardId>) -> Vec<ShardId> {
        let topology = self.topology();
        let local = self.state.local();
        shards
            .into_iter()
            .filter(|id| topology.owners_of(id.shard).contains(local))
            .collect()
    }

    /// Joins through the node set and folds the resulting members into the topology.
    pub async fn join(&self, initial: Vec<Node>) -> Result<(), MembershipError> {
        self.node_set.join(initial).await?;
        let added = self.sync_from_node_set();
        tracing::info!(
            "Joined {:?} cluster: {} node(s), {} new",
            self.node_set.kind(),
            self.topology().nodes.len(),
            added
        );
        Ok(())
    }

    /// Adds every member the node set knows about. Returns how many were new.
    pub fn sync_from_node_set(&self) -> usize {
        self.node_set
            .nodes()
            .into_iter()
            .filter(|node| self.state.apply(&ClusterEvent::NodeJoined { node: node.clone() }))
            .count()
    }

    /// Applies an event that arrived from a peer.
    ///
    /// A resize is sent to every node in the originator's topology, and the
    /// originator reports the ones it missed as a partial resize. So once it lands
    /// here, every other member is taken to run with the new factor too.
    pub fn receive(&self, event: &ClusterEvent) -> bool {
        let applied = self.state.apply(event);
        if let (true, ClusterEvent::ClusterResized { replica_n }) = (applied, event) {
            let local = self.state.local();
            let peers: Vec<Node> = self
                .topology()
                .nodes
                .iter()
                .filter(|node| *node != local)
                .cloned()
                .collect();
            self.node_set.advertise_replica_factor(*replica_n);
            self.node_set.peers_resized(&peers, *replica_n);
        }
        applied
    }

    /// Changes the replica factor here and tells everyone else, waiting for the
    /// fan-out. Nodes that could not be reached are kept as a health warning until a
    /// later resize reaches everybody.
    pub async fn resize(&self, replica_n: usize) -> Result<BroadcastReport, ClusterError> {
        if replica_n == 0 {
            return Err(ClusterError::ZeroReplicaFactor);
        }

        let event = ClusterEvent::ClusterResized { replica_n };
        self.state.apply(&event);
        self.node_set.advertise_replica_factor(replica_n);

        let report = self.broadcaster.send_sync(event).await?;
        self.node_set.peers_resized(&report.reached, replica_n);

        let mut hazards = self.hazards.lock();
        hazards.retain(|w| !matches!(w, HealthWarning::PartialResize { .. }));
        if !report.is_complete() {
            let unreached: Vec<String> = report.unreached.iter().map(|n| n.host.clone()).collect();
            tracing::warn!(
                "Resize to {} did not reach {:?}; ownership may diverge",
                replica_n,
                unreached
            );
            hazards.push(HealthWarning::PartialResize {
                replica_n,
                unreached,
            });
        }

        Ok(report)
    }

    pub async fn create_index(&self, index: &str) -> Result<(), ClusterError> {
        self.publish(ClusterEvent::CreateIndex {
            index: index.to_string(),
        })
        .await
    }

    pub async fn delete_index(&self, index: &str) -> Result<(), ClusterError> {
        self.publish(ClusterEvent::DeleteIndex {
            index: index.to_string(),
        })
        .await
    }

    pub async fn create_field(&self, index: &str, field: &str) -> Result<(), ClusterError> {
        self.require_index(index)?;
        self.publish(ClusterEvent::CreateField {
            index: index.to_string(),
            field: field.to_string(),
        })
        .await
    }

    pub async fn delete_field(&self, index: &str, field: &str) -> Result<(), ClusterError> {
        self.publish(ClusterEvent::DeleteField {
            index: index.to_string(),
            field: field.to_string(),
        })
        .await
    }

    /// Announces that `index` now has data up to `shard`.
    pub async fn create_shard(&self, index: &str, shard: u64) -> Result<(), ClusterError> {
        self.require_index(index)?;
        self.publish(ClusterEvent::CreateShard {
            index: index.to_string(),
            shard,
        })
        .await
    }

    fn require_index(&self, index: &str) -> Result<(), ClusterError> {
        if self.state.schema().has_index(index) {
            Ok(())
        } else {
            Err(ClusterError::UnknownIndex(index.to_string()))
        }
    }

    async fn publish(&self, event: ClusterEvent) -> Result<(), ClusterError> {
        if self.state.apply(&event) {
            self.broadcaster.send(event).await?;
        }
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        let topology = self.topology();
        let local = self.state.local().clone();
        let mut warnings = Vec::new();

        if topology.is_under_replicated() {
            warnings.push(HealthWarning::UnderReplicated {
                replica_n: topology.replica_n,
                live: topology.nodes.len(),
            });
        }

        for node in self.node_set.nodes() {
            if node == local {
                continue;
            }
            let Some(meta) = node.meta else {
                continue;
            };
            if meta.replica_n != topology.replica_n {
                warnings.push(HealthWarning::ReplicaFactorDivergence {
                    node: node.host.clone(),
                    theirs: meta.replica_n,
                    ours: topology.replica_n,
                });
            }
        }

        warnings.extend(self.hazards.lock().iter().cloned());

        let ours = self.state.shard_width().exponent();
        let mut rejected = self.node_set.rejected_peers();
        rejected.sort();
        for (node, theirs) in rejected {
            warnings.push(HealthWarning::ShardWidthMismatch { node, theirs, ours });
        }

        HealthReport {
            local,
            nodes: topology.nodes.clone(),
            replica_n: topology.replica_n,
            topology_version: topology.version,
            warnings,
        }
    }
}
