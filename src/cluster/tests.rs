//! Cluster Module Tests
//!
//! ## Test Scopes
//! - **State**: snapshot publishing, idempotent event application, schema bookkeeping.
//! - **Service**: ownership queries, resize, schema operations.
//! - **Health**: every topology hazard surfaces as a warning.
//! - **Scenario**: 3-node static cluster with replica factor 2.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::broadcast::types::ClusterEvent;
    use crate::broadcast::{HttpBroadcaster, NopBroadcaster};
    use crate::cluster::{Cluster, ClusterState, HealthWarning};
    use crate::config::{HttpConfig, MembershipKind};
    use crate::error::{ClusterError, MembershipError};
    use crate::membership::types::{Node, NodeMeta, NodeState};
    use crate::membership::{HttpNodeSet, NodeSet, StaticNodeSet};
    use crate::shard::{ShardId, ShardWidth};

    const HOSTS: [&str; 3] = ["node0:10101", "node1:10101", "node2:10101"];

    fn nodes(hosts: &[&str]) -> Vec<Node> {
        hosts.iter().map(|h| Node::new(*h)).collect()
    }

    async fn static_cluster(local: &str, hosts: &[&str], replica_n: usize) -> Cluster {
        let state = ClusterState::new(Node::new(local), vec![], replica_n, ShardWidth::default());
        let cluster = Cluster::new(
            state,
            Arc::new(StaticNodeSet::new()),
            Arc::new(NopBroadcaster),
        );
        cluster.join(nodes(hosts)).await.unwrap();
        cluster
    }

    /// A node set that reports fixed members, with metadata.
    struct FixedNodeSet {
        nodes: Vec<Node>,
        rejected: Vec<(String, u32)>,
    }

    #[async_trait]
    impl NodeSet for FixedNodeSet {
        async fn join(&self, _initial: Vec<Node>) -> Result<(), MembershipError> {
            Ok(())
        }

        fn nodes(&self) -> Vec<Node> {
            self.nodes.clone()
        }

        fn kind(&self) -> MembershipKind {
            MembershipKind::Http
        }

        fn rejected_peers(&self) -> Vec<(String, u32)> {
            self.rejected.clone()
        }
    }

    fn with_replicas(host: &str, replica_n: usize) -> Node {
        Node::new(host).with_meta(NodeMeta {
            protocol_version: 1,
            state: NodeState::Alive,
            replica_n,
            shard_width: 24,
        })
    }

    // ============================================================
    // STATE TESTS
    // ============================================================

    #[test]
    fn test_state_includes_local_node() {
        let state = ClusterState::new(Node::new("me:1"), nodes(&["b:1", "a:1"]), 1, ShardWidth::default());
        assert_eq!(state.topology().nodes, nodes(&["a:1", "b:1", "me:1"]));
    }

    #[test]
    fn test_apply_is_idempotent_and_versions_topology() {
        let state = ClusterState::new(Node::new("a:1"), vec![], 1, ShardWidth::default());
        let joined = ClusterEvent::NodeJoined {
            node: Node::new("b:1"),
        };

        assert!(state.apply(&joined));
        assert_eq!(state.topology().version, 1);
        assert!(!state.apply(&joined));
        assert_eq!(state.topology().version, 1, "No-op events do not publish");
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let state = ClusterState::new(Node::new("a:1"), nodes(&["b:1"]), 1, ShardWidth::default());
        let before = state.topology();

        state.apply(&ClusterEvent::NodeLeft {
            node: Node::new("b:1"),
        });

        assert_eq!(before.nodes.len(), 2, "An old snapshot never changes");
        assert_eq!(state.topology().nodes.len(), 1);
    }

    #[test]
    fn test_local_node_never_leaves() {
        let state = ClusterState::new(Node::new("a:1"), vec![], 1, ShardWidth::default());
        assert!(!state.apply(&ClusterEvent::NodeLeft {
            node: Node::new("a:1"),
        }));
        assert!(state.topology().contains(&Node::new("a:1")));
    }

    #[test]
    fn test_resize_to_zero_is_ignored() {
        let state = ClusterState::new(Node::new("a:1"), vec![], 2, ShardWidth::default());
        assert!(!state.apply(&ClusterEvent::ClusterResized { replica_n: 0 }));
        assert_eq!(state.topology().replica_n, 2);
    }

    #[test]
    fn test_schema_events() {
        let state = ClusterState::new(Node::new("a:1"), vec![], 1, ShardWidth::default());
        let schema = state.schema();

        state.apply(&ClusterEvent::CreateIndex { index: "i".into() });
        state.apply(&ClusterEvent::CreateField {
            index: "i".into(),
            field: "f".into(),
        });
        state.apply(&ClusterEvent::CreateShard {
            index: "i".into(),
            shard: 2,
        });
        // Lower shard announcements never shrink the index.
        state.apply(&ClusterEvent::CreateShard {
            index: "i".into(),
            shard: 1,
        });

        assert_eq!(schema.index("i").unwrap().max_shard, Some(2));
        assert_eq!(
            schema.shards(),
            vec![
                ShardId::new("i", "f", 0),
                ShardId::new("i", "f", 1),
                ShardId::new("i", "f", 2),
            ]
        );

        state.apply(&ClusterEvent::DeleteField {
            index: "i".into(),
            field: "f".into(),
        });
        assert!(schema.shards().is_empty());

        state.apply(&ClusterEvent::DeleteIndex { index: "i".into() });
        assert!(schema.index_names().is_empty());
    }

    #[test]
    fn test_shards_where_asks_once_per_shard_number() {
        let state = ClusterState::new(Node::new("a:1"), vec![], 1, ShardWidth::default());
        let schema = state.schema();
        state.apply(&ClusterEvent::CreateIndex { index: "i".into() });
        for field in ["f", "g", "h"] {
            state.apply(&ClusterEvent::CreateField {
                index: "i".into(),
                field: field.into(),
            });
        }
        state.apply(&ClusterEvent::CreateShard {
            index: "i".into(),
            shard: 9_999,
        });

        let asked = std::sync::atomic::AtomicUsize::new(0);
        let kept = schema.shards_where(|shard| {
            asked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            shard % 1000 == 0
        });

        assert_eq!(asked.into_inner(), 10_000);
        assert_eq!(kept.len(), 30);
        assert!(kept.iter().all(|id| id.shard % 1000 == 0));
        assert_eq!(schema.shards().len(), 30_000);
    }

    #[test]
    fn test_field_event_before_index_event() {
        let state = ClusterState::new(Node::new("a:1"), vec![], 1, ShardWidth::default());

        state.apply(&ClusterEvent::CreateField {
            index: "late".into(),
            field: "f".into(),
        });
        state.apply(&ClusterEvent::CreateIndex {
            index: "late".into(),
        });

        assert!(state.schema().index("late").unwrap().fields.contains("f"));
    }

    // ============================================================
    // SCENARIO: 3-NODE STATIC CLUSTER
    // ============================================================

    #[tokio::test]
    async fn test_three_node_static_cluster() {
        let cluster = static_cluster(HOSTS[0], &HOSTS, 2).await;

        assert_eq!(cluster.shard_of(16_777_216), 1);
        assert_eq!(cluster.shard_of(16_777_215), 0);
        assert_eq!(cluster.nodes(), nodes(&HOSTS));
        assert_eq!(cluster.replica_factor(), 2);

        let owners = cluster.owners_of(1);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
        for owner in &owners {
            assert!(cluster.contains_node(owner));
        }
        for _ in 0..10 {
            assert_eq!(cluster.owners_of(1), owners);
        }

        // Every node computes the same owners.
        for host in &HOSTS[1..] {
            let peer = static_cluster(host, &HOSTS, 2).await;
            assert_eq!(peer.owners_of(1), owners);
        }
    }

    #[tokio::test]
    async fn test_ownership_helpers() {
        let cluster = static_cluster(HOSTS[0], &HOSTS, 1).await;
        let local = cluster.local_node();

        let shards: Vec<ShardId> = (0..30).map(|s| ShardId::new("i", "f", s)).collect();
        let mine = cluster.local_shards(shards.clone());

        for shard in &shards {
            let owners = cluster.shard_owners(shard);
            assert_eq!(owners.len(), 1);
            assert_eq!(cluster.owns_shard(&local, shard.shard), mine.contains(shard));
        }
        assert!(!mine.is_empty() && mine.len() < shards.len());
    }

    // ============================================================
    // RESIZE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_resize_zero_is_rejected() {
        let cluster = static_cluster(HOSTS[0], &HOSTS, 2).await;
        assert!(matches!(
            cluster.resize(0).await,
            Err(ClusterError::ZeroReplicaFactor)
        ));
        assert_eq!(cluster.replica_factor(), 2);
    }

    #[tokio::test]
    async fn test_resize_changes_owner_count() {
        let cluster = static_cluster(HOSTS[0], &HOSTS, 2).await;

        let report = cluster.resize(3).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(cluster.replica_factor(), 3);
        assert_eq!(cluster.owners_of(9).len(), 3);
        assert!(cluster.health().is_healthy());
    }

    #[tokio::test]
    async fn test_partial_resize_is_a_warning() {
        let state = ClusterState::new(
            Node::new("127.0.0.1:0"),
            nodes(&["127.0.0.1:1"]),
            1,
            ShardWidth::default(),
        );
        let broadcaster = HttpBroadcaster::new(
            state.clone(),
            HttpConfig {
                timeout_ms: 200,
                retries: 1,
            },
        );
        let cluster = Cluster::new(state, Arc::new(StaticNodeSet::new()), Arc::new(broadcaster));

        let report = cluster.resize(2).await.unwrap();
        assert_eq!(report.unreached, nodes(&["127.0.0.1:1"]));
        assert_eq!(cluster.replica_factor(), 2, "Local change sticks");

        let warnings = cluster.health().warnings;
        assert!(warnings.contains(&HealthWarning::PartialResize {
            replica_n: 2,
            unreached: vec!["127.0.0.1:1".to_string()],
        }));
    }

    #[tokio::test]
    async fn test_received_resize_clears_divergence() {
        let node_set = Arc::new(HttpNodeSet::new(
            Node::new("b:1"),
            ShardWidth::default(),
            2,
            HttpConfig::default(),
        ));
        node_set.register(with_replicas("a:1", 2));
        node_set.register(with_replicas("c:1", 2));

        let state = ClusterState::new(Node::new("b:1"), nodes(&["a:1", "c:1"]), 2, ShardWidth::default());
        let cluster = Cluster::new(state, node_set.clone(), Arc::new(NopBroadcaster));
        assert!(cluster.health().is_healthy());

        assert!(cluster.receive(&ClusterEvent::ClusterResized { replica_n: 1 }));

        assert_eq!(cluster.replica_factor(), 1);
        assert_eq!(node_set.local_node().meta.unwrap().replica_n, 1);
        assert!(cluster.health().is_healthy(), "{:?}", cluster.health().warnings);
    }

    #[tokio::test]
    async fn test_unreached_peer_keeps_old_factor() {
        let node_set = Arc::new(HttpNodeSet::new(
            Node::new("127.0.0.1:0"),
            ShardWidth::default(),
            1,
            HttpConfig::default(),
        ));
        node_set.register(with_replicas("127.0.0.1:1", 1));

        let state = ClusterState::new(
            Node::new("127.0.0.1:0"),
            nodes(&["127.0.0.1:1"]),
            1,
            ShardWidth::default(),
        );
        let broadcaster = HttpBroadcaster::new(
            state.clone(),
            HttpConfig {
                timeout_ms: 200,
                retries: 1,
            },
        );
        let cluster = Cluster::new(state, node_set, Arc::new(broadcaster));

        cluster.resize(2).await.unwrap();

        let warnings = cluster.health().warnings;
        assert!(warnings.contains(&HealthWarning::ReplicaFactorDivergence {
            node: "127.0.0.1:1".to_string(),
            theirs: 1,
            ours: 2,
        }));
        assert!(warnings.iter().any(|w| matches!(w, HealthWarning::PartialResize { .. })));
    }

    // ============================================================
    // SCHEMA OPERATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_schema_operations() {
        let cluster = static_cluster(HOSTS[0], &HOSTS, 2).await;

        assert!(matches!(
            cluster.create_field("missing", "f").await,
            Err(ClusterError::UnknownIndex(_))
        ));
        assert!(matches!(
            cluster.create_shard("missing", 1).await,
            Err(ClusterError::UnknownIndex(_))
        ));

        cluster.create_index("i").await.unwrap();
        cluster.create_index("i").await.unwrap();
        cluster.create_field("i", "f").await.unwrap();
        cluster.create_shard("i", 4).await.unwrap();
        assert_eq!(cluster.state().schema().shards().len(), 5);

        cluster.delete_field("i", "f").await.unwrap();
        cluster.delete_index("i").await.unwrap();
        assert!(!cluster.state().schema().has_index("i"));
    }

    // ============================================================
    // HEALTH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_under_replication_warning() {
        let cluster = static_cluster(HOSTS[0], &HOSTS[..2], 3).await;
        let health = cluster.health();

        assert_eq!(
            health.warnings,
            vec![HealthWarning::UnderReplicated {
                replica_n: 3,
                live: 2,
            }]
        );
        // Every node owns every shard when under-replicated.
        assert_eq!(cluster.owners_of(5).len(), 2);
    }

    #[tokio::test]
    async fn test_divergence_and_width_warnings() {
        let node_set = FixedNodeSet {
            nodes: vec![
                with_replicas("a:1", 2),
                with_replicas("b:1", 2),
                with_replicas("c:1", 3),
            ],
            rejected: vec![("odd:1".to_string(), 20)],
        };
        let state = ClusterState::new(Node::new("a:1"), vec![], 2, ShardWidth::default());
        let cluster = Cluster::new(state, Arc::new(node_set), Arc::new(NopBroadcaster));
        cluster.join(vec![]).await.unwrap();

        let health = cluster.health();
        assert_eq!(health.nodes.len(), 3);
        assert_eq!(
            health.warnings,
            vec![
                HealthWarning::ReplicaFactorDivergence {
                    node: "c:1".to_string(),
                    theirs: 3,
                    ours: 2,
                },
                HealthWarning::ShardWidthMismatch {
                    node: "odd:1".to_string(),
                    theirs: 20,
                    ours: 24,
                },
            ]
        );
        assert!(!health.is_healthy());
    }
}
