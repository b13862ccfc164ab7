//! HTTP membership: every node registers itself with every configured peer.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::NodeSet;
use super::types::{Node, NodeMeta, NodeState, PROTOCOL_VERSION};
use crate::config::{HttpConfig, MembershipKind};
use crate::error::MembershipError;
use crate::net::{post_with_retry, url};
use crate::protocol::{ENDPOINT_JOIN, JoinRequest, JoinResponse};
use crate::shard::ShardWidth;

pub struct HttpNodeSet {
    local: Node,
    shard_width: ShardWidth,
    replica_n: AtomicUsize,
    registered: RwLock<BTreeMap<String, Node>>,
    rejected: DashMap<String, u32>,
    http_client: reqwest::Client,
    config: HttpConfig,
}

impl HttpNodeSet {
    pub fn new(local: Node, shard_width: ShardWidth, replica_n: usize, config: HttpConfig) -> Self {
        let node_set = Self {
            local: Node::new(local.host),
            shard_width,
            replica_n: AtomicUsize::new(replica_n),
            registered: RwLock::new(BTreeMap::new()),
            rejected: DashMap::new(),
            http_client: reqwest::Client::new(),
            config,
        };
        node_set.register(node_set.local_node());
        node_set
    }

    /// The local node with its advertised metadata.
    pub fn local_node(&self) -> Node {
        self.local.clone().with_meta(NodeMeta {
            protocol_version: PROTOCOL_VERSION,
            state: NodeState::Alive,
            replica_n: self.replica_n.load(Ordering::Relaxed),
            shard_width: self.shard_width.exponent(),
        })
    }

    pub fn shard_width(&self) -> ShardWidth {
        self.shard_width
    }

    /// Adds or refreshes a node. Returns true if it was not known before.
    pub fn register(&self, node: Node) -> bool {
        let mut registered = self.registered.write();
        let is_new = !registered.contains_key(&node.host);
        if is_new || node.meta.is_some() {
            registered.insert(node.host.clone(), node);
        }
        is_new
    }

    pub fn reject(&self, host: &str, theirs: u32) {
        tracing::warn!(
            "Rejecting {}: shard width {} does not match ours ({})",
            host,
            theirs,
            self.shard_width.exponent()
        );
        self.rejected.insert(host.to_string(), theirs);
    }

    async fn register_with(&self, peer: &Node) -> Result<Vec<Node>, MembershipError> {
        let request = JoinRequest {
            node: self.local_node(),
            shard_width: self.shard_width.exponent(),
            replica_n: self.replica_n.load(Ordering::Relaxed),
        };

        let response = post_with_retry(
            &self.http_client,
            &url(&peer.host, ENDPOINT_JOIN),
            &request,
            self.config.timeout(),
            self.config.retries,
        )
        .await
        .map_err(|e| MembershipError::PeerUnreachable {
            peer: peer.host.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::CONFLICT {
            return Err(MembershipError::JoinRejected {
                peer: peer.host.clone(),
                status: status.as_u16(),
            });
        }

        let join: JoinResponse =
            response
                .json()
                .await
                .map_err(|e| MembershipError::PeerUnreachable {
                    peer: peer.host.clone(),
                    reason: e.to_string(),
                })?;

        if !join.accepted || join.shard_width != self.shard_width.exponent() {
            self.rejected.insert(peer.host.clone(), join.shard_width);
            return Err(MembershipError::ShardWidthMismatch {
                peer: peer.host.clone(),
                theirs: join.shard_width,
                ours: self.shard_width.exponent(),
            });
        }

        Ok(join.nodes)
    }
}

#[async_trait]
impl NodeSet for HttpNodeSet {
    async fn join(&self, initial: Vec<Node>) -> Result<(), MembershipError> {
        let peers: Vec<Node> = initial
            .into_iter()
            .filter(|node| *node != self.local)
            .collect();

        tracing::info!("Registering with {} peer(s) over HTTP", peers.len());

        let results =
            futures::future::join_all(peers.iter().map(|peer| self.register_with(peer))).await;

        for (peer, result) in peers.iter().zip(results) {
            let known = result?;
            self.register(peer.clone());
            for node in known {
                if self.register(node.clone()) {
                    tracing::info!("Learned about {} from {}", node, peer);
                }
            }
        }

        tracing::info!("HTTP node set now has {} node(s)", self.registered.read().len());
        Ok(())
    }

    fn nodes(&self) -> Vec<Node> {
        self.registered.read().values().cloned().collect()
    }

    fn kind(&self) -> MembershipKind {
        MembershipKind::Http
    }

    fn rejected_peers(&self) -> Vec<(String, u32)> {
        self.rejected
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn advertise_replica_factor(&self, replica_n: usize) {
        self.replica_n.store(replica_n, Ordering::Relaxed);
        self.register(self.local_node());
    }

    /// Peer metadata is otherwise only refreshed on join.
    fn peers_resized(&self, peers: &[Node], replica_n: usize) {
        let mut registered = self.registered.write();
        for peer in peers {
            if let Some(meta) = registered
                .get_mut(&peer.host)
                .and_then(|node| node.meta.as_mut())
            {
                meta.replica_n = replica_n;
            }
        }
    }
}
