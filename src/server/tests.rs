//! Server Module Tests
//!
//! Full nodes on localhost, wired exactly as the binary wires them.
//!
//! ## Test Scopes
//! - **Wiring**: configuration errors stop startup.
//! - **HTTP membership**: three nodes register with each other, resize and schema
//!   events reach everyone, a foreign shard width is refused.
//! - **Gossip membership**: two nodes find each other and exchange events.
//! - **Repair over HTTP**: the repairer pulls a shard through the internal API.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    use crate::cluster::{HealthReport, HealthWarning};
    use crate::config::{AntiEntropyConfig, ClusterConfig, GossipConfig, HttpConfig};
    use crate::error::{MembershipError, ServerError};
    use crate::membership::types::Node;
    use crate::net::url;
    use crate::protocol::{ENDPOINT_HEALTH, ENDPOINT_NODES};
    use crate::server::Server;
    use crate::shard::ShardWidth;
    use crate::storage::MemoryShardStore;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        (listener, host)
    }

    fn config(host: &str, nodes: &[String], membership: &str) -> ClusterConfig {
        ClusterConfig {
            host: host.to_string(),
            nodes: nodes.to_vec(),
            replicas: 2,
            membership: membership.to_string(),
            http: HttpConfig {
                timeout_ms: 1000,
                retries: 2,
            },
            gossip: GossipConfig {
                port: 0,
                interval_ms: 50,
                join_timeout_ms: 2000,
                ..GossipConfig::default()
            },
            anti_entropy: AntiEntropyConfig {
                interval_secs: 0,
                ..AntiEntropyConfig::default()
            },
            ..ClusterConfig::default()
        }
    }

    fn store() -> Arc<MemoryShardStore> {
        Arc::new(MemoryShardStore::new(ShardWidth::default()))
    }

    async fn open(config: ClusterConfig, listener: TcpListener) -> Server {
        let server = Server::new(config, store()).await.unwrap();
        serve(&server, listener);
        server
    }

    fn serve(server: &Server, listener: TcpListener) {
        let app = server.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    // ============================================================
    // WIRING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unknown_membership_is_fatal() {
        let result = Server::new(config("127.0.0.1:10101", &[], "zookeeper"), store()).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_host_is_fatal() {
        let result = Server::new(config("ftp://127.0.0.1:10101", &[], "static"), store()).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_http_unreachable_peer_is_fatal() {
        let (listener, host) = listener().await;
        let server = open(config(&host, &["127.0.0.1:1".to_string()], "http"), listener).await;

        let result = server.start().await;
        assert!(matches!(
            result,
            Err(ServerError::Membership(MembershipError::PeerUnreachable { .. }))
        ));
    }

    // ============================================================
    // HTTP MEMBERSHIP TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_http_cluster() {
        let mut listeners = Vec::new();
        let mut hosts = Vec::new();
        for _ in 0..3 {
            let (listener, host) = listener().await;
            listeners.push(listener);
            hosts.push(host);
        }

        let mut servers = Vec::new();
        for (listener, host) in listeners.into_iter().zip(&hosts) {
            servers.push(open(config(host, &hosts, "http"), listener).await);
        }

        let started = futures::future::join_all(servers.iter().map(|s| s.start())).await;
        for result in started {
            result.unwrap();
        }

        let mut expected: Vec<Node> = hosts.iter().map(Node::new).collect();
        expected.sort();
        for server in &servers {
            assert_eq!(server.cluster().nodes(), expected);
        }

        // All nodes agree on ownership.
        let owners = servers[0].cluster().owners_of(1);
        assert_eq!(owners.len(), 2);
        for server in &servers[1..] {
            assert_eq!(server.cluster().owners_of(1), owners);
        }

        // Resize waits for the fan-out.
        let report = servers[0].cluster().resize(3).await.unwrap();
        assert_eq!(report.reached.len(), 2);
        assert!(report.is_complete());
        for server in &servers {
            assert_eq!(server.cluster().replica_factor(), 3);
            let health = server.cluster().health();
            assert!(health.is_healthy(), "{:?}", health.warnings);
        }

        // Schema events are fire-and-continue.
        servers[1].cluster().create_index("users").await.unwrap();
        let spread = wait_until(Duration::from_secs(5), || {
            servers
                .iter()
                .all(|s| s.cluster().state().schema().has_index("users"))
        })
        .await;
        assert!(spread, "create_index should reach every node");

        // Internal API.
        let client = reqwest::Client::new();
        let listed: Vec<Node> = client
            .get(url(&hosts[2], ENDPOINT_NODES))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed, expected);

        let health: HealthReport = client
            .get(url(&hosts[2], ENDPOINT_HEALTH))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.replica_n, 3);
        assert_eq!(health.nodes.len(), 3);

        for server in &servers {
            server.close().await;
        }
    }

    #[tokio::test]
    async fn test_http_join_rejects_foreign_shard_width() {
        let (listener_a, host_a) = listener().await;
        let (listener_b, host_b) = listener().await;

        let a = open(config(&host_a, &[], "http"), listener_a).await;
        a.start().await.unwrap();

        let mut odd = config(&host_b, &[host_a.clone()], "http");
        odd.shard_width = 20;
        let b = open(odd, listener_b).await;

        let result = b.start().await;
        assert!(matches!(
            result,
            Err(ServerError::Membership(MembershipError::ShardWidthMismatch {
                theirs: 24,
                ours: 20,
                ..
            }))
        ));

        assert!(!a.cluster().contains_node(&Node::new(host_b.clone())));
        assert!(a.cluster().health().warnings.contains(&HealthWarning::ShardWidthMismatch {
            node: host_b,
            theirs: 20,
            ours: 24,
        }));
    }

    // ============================================================
    // GOSSIP MEMBERSHIP TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_node_gossip_cluster_spreads_events() {
        let (listener_a, host_a) = listener().await;
        let (listener_b, host_b) = listener().await;

        let a = open(config(&host_a, &[], "gossip"), listener_a).await;
        a.start().await.unwrap();
        let seed = a.gossip().unwrap().local_addr();

        let mut config_b = config(&host_b, &[], "gossip");
        config_b.gossip.seed = Some(seed.to_string());
        let b = open(config_b, listener_b).await;
        b.start().await.unwrap();

        let joined = wait_until(Duration::from_secs(5), || {
            a.cluster().nodes().len() == 2 && b.cluster().nodes().len() == 2
        })
        .await;
        assert!(joined, "Nodes should discover each other");

        a.cluster().create_index("events").await.unwrap();
        a.cluster().resize(1).await.unwrap();

        let spread = wait_until(Duration::from_secs(5), || {
            b.cluster().state().schema().has_index("events") && b.cluster().replica_factor() == 1
        })
        .await;
        assert!(spread, "Piggybacked events should reach the other node");

        let settled = wait_until(Duration::from_secs(5), || {
            a.cluster().health().is_healthy() && b.cluster().health().is_healthy()
        })
        .await;
        assert!(settled, "Both nodes should advertise the new factor");

        a.close().await;
        b.close().await;
    }

    // ============================================================
    // REPAIR OVER HTTP TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_repair_pulls_shard_over_http() {
        let (listener_a, host_a) = listener().await;
        let (listener_b, host_b) = listener().await;
        let hosts = vec![host_a.clone(), host_b.clone()];

        let store_a = store();
        for column in [3u64, 5, 8, 13] {
            store_a.set_bit("i", "f", column);
        }
        let a = Server::new(config(&host_a, &hosts, "static"), store_a.clone())
            .await
            .unwrap();
        serve(&a, listener_a);

        let store_b = store();
        let b = Server::new(config(&host_b, &hosts, "static"), store_b.clone())
            .await
            .unwrap();
        serve(&b, listener_b);

        a.start().await.unwrap();
        b.start().await.unwrap();

        let cluster = b.cluster();
        cluster.create_index("i").await.unwrap();
        cluster.create_field("i", "f").await.unwrap();
        cluster.create_shard("i", 0).await.unwrap();

        let first = b.repairer().run_cycle().await;
        assert_eq!(first.scanned, 1);
        assert_eq!(first.transfers, 1);
        for column in [3u64, 5, 8, 13] {
            assert!(store_b.contains("i", "f", column));
        }

        let second = b.repairer().run_cycle().await;
        assert_eq!(second.transfers, 0);
        assert_eq!(second.in_sync, 1);
    }
}
