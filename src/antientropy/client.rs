use async_trait::async_trait;
use std::time::Duration;

use crate::error::RepairError;
use crate::membership::types::Node;
use crate::net::{get_with_retry, post_with_retry, url};
use crate::protocol::{digest_path, shard_path};
use crate::shard::ShardId;
use crate::storage::{ShardDelta, ShardDigest};

/// Node-to-node shard RPCs used by the repairer.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn digest(&self, node: &Node, shard: &ShardId) -> Result<ShardDigest, RepairError>;

    async fn fetch(&self, node: &Node, shard: &ShardId) -> Result<ShardDelta, RepairError>;

    async fn push(&self, node: &Node, shard: &ShardId, delta: &ShardDelta)
    -> Result<(), RepairError>;
}

/// Talks to the `/internal/shards` API of other nodes.
pub struct HttpReplicaClient {
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpReplicaClient {
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
            attempts,
        }
    }

    fn unreachable(&self, node: &Node, e: reqwest::Error) -> RepairError {
        if e.is_timeout() {
            RepairError::Timeout {
                peer: node.host.clone(),
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            RepairError::PeerUnreachable {
                peer: node.host.clone(),
                reason: e.to_string(),
            }
        }
    }

    fn check(node: &Node, resp: &reqwest::Response) -> Result<(), RepairError> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RepairError::BadStatus {
                peer: node.host.clone(),
                status: resp.status().as_u16(),
            })
        }
    }
}

#[async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn digest(&self, node: &Node, shard: &ShardId) -> Result<ShardDigest, RepairError> {
        let target = url(&node.host, &digest_path(&shard.index, &shard.field, shard.shard));
        let resp = get_with_retry(&self.http_client, &target, self.timeout, self.attempts)
            .await
            .map_err(|e| self.unreachable(node, e))?;
        Self::check(node, &resp)?;
        resp.json().await.map_err(|e| self.unreachable(node, e))
    }

    async fn fetch(&self, node: &Node, shard: &ShardId) -> Result<ShardDelta, RepairError> {
        let target = url(&node.host, &shard_path(&shard.index, &shard.field, shard.shard));
        let resp = get_with_retry(&self.http_client, &target, self.timeout, self.attempts)
            .await
            .map_err(|e| self.unreachable(node, e))?;
        Self::check(node, &resp)?;
        resp.json().await.map_err(|e| self.unreachable(node, e))
    }

    async fn push(
        &self,
        node: &Node,
        shard: &ShardId,
        delta: &ShardDelta,
    ) -> Result<(), RepairError> {
        let target = url(&node.host, &shard_path(&shard.index, &shard.field, shard.shard));
        let resp = post_with_retry(&self.http_client, &target, delta, self.timeout, self.attempts)
            .await
            .map_err(|e| self.unreachable(node, e))?;
        Self::check(node, &resp)
    }
}
