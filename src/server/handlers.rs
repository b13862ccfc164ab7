use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::broadcast::types::{ClusterEvent, EventEnvelope};
use crate::cluster::{Cluster, HealthReport};
use crate::membership::{HttpNodeSet, NodeSet};
use crate::membership::types::Node;
use crate::protocol::{JoinRequest, JoinResponse};
use crate::shard::ShardId;
use crate::storage::{ShardDelta, ShardDigest, ShardStore};

/// Everything the internal API handlers need.
pub struct ApiContext {
    pub cluster: Arc<Cluster>,
    pub store: Arc<dyn ShardStore>,
    /// Set when the node runs HTTP membership.
    pub http_node_set: Option<Arc<HttpNodeSet>>,
}

pub async fn handle_join(
    Extension(ctx): Extension<Arc<ApiContext>>,
    Json(req): Json<JoinRequest>,
) -> (StatusCode, Json<JoinResponse>) {
    let ours = ctx.cluster.shard_width().exponent();

    let Some(node_set) = ctx.http_node_set.as_ref() else {
        tracing::warn!("Join from {} but this node does not use HTTP membership", req.node);
        return (
            StatusCode::BAD_REQUEST,
            Json(JoinResponse {
                accepted: false,
                shard_width: ours,
                nodes: Vec::new(),
            }),
        );
    };

    if req.shard_width != ours {
        node_set.reject(&req.node.host, req.shard_width);
        return (
            StatusCode::CONFLICT,
            Json(JoinResponse {
                accepted: false,
                shard_width: ours,
                nodes: Vec::new(),
            }),
        );
    }

    if req.replica_n != ctx.cluster.replica_factor() {
        tracing::warn!(
            "{} joined with replica factor {}, ours is {}",
            req.node,
            req.replica_n,
            ctx.cluster.replica_factor()
        );
    }

    let is_new = node_set.register(req.node.clone());
    let event = ClusterEvent::NodeJoined {
        node: Node::new(req.node.host.clone()),
    };
    if ctx.cluster.receive(&event) || is_new {
        tracing::info!("Node {} registered", req.node);
        if let Err(e) = ctx.cluster.broadcaster().send(event).await {
            tracing::error!("Failed to announce {}: {}", req.node, e);
        }
    }

    (
        StatusCode::OK,
        Json(JoinResponse {
            accepted: true,
            shard_width: ours,
            nodes: node_set.nodes(),
        }),
    )
}

pub async fn handle_message(
    Extension(ctx): Extension<Arc<ApiContext>>,
    Json(envelope): Json<EventEnvelope>,
) -> StatusCode {
    tracing::debug!("Received {} from {}", envelope.event.kind(), envelope.origin);

    if envelope.origin == ctx.cluster.local_node().host {
        return StatusCode::OK;
    }

    if let (ClusterEvent::NodeJoined { node }, Some(node_set)) =
        (&envelope.event, ctx.http_node_set.as_ref())
    {
        node_set.register(node.clone());
    }

    ctx.cluster.receive(&envelope.event);
    StatusCode::OK
}

pub async fn handle_nodes(Extension(ctx): Extension<Arc<ApiContext>>) -> Json<Vec<Node>> {
    Json(ctx.cluster.nodes())
}

pub async fn handle_health(Extension(ctx): Extension<Arc<ApiContext>>) -> Json<HealthReport> {
    Json(ctx.cluster.health())
}

pub async fn handle_digest(
    Extension(ctx): Extension<Arc<ApiContext>>,
    Path((index, field, shard)): Path<(String, String, u64)>,
) -> Json<ShardDigest> {
    let id = ShardId::new(index, field, shard);
    Json(ctx.store.digest_of(&id))
}

pub async fn handle_fetch(
    Extension(ctx): Extension<Arc<ApiContext>>,
    Path((index, field, shard)): Path<(String, String, u64)>,
) -> Result<Json<ShardDelta>, (StatusCode, String)> {
    let id = ShardId::new(index, field, shard);
    match ctx.store.export(&id) {
        Ok(delta) => Ok(Json(delta)),
        Err(e) => {
            tracing::error!("Failed to export {}: {}", id, e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn handle_push(
    Extension(ctx): Extension<Arc<ApiContext>>,
    Path((index, field, shard)): Path<(String, String, u64)>,
    Json(delta): Json<ShardDelta>,
) -> (StatusCode, String) {
    let id = ShardId::new(index, field, shard);
    match ctx.store.apply_delta(&id, &delta) {
        Ok(()) => {
            tracing::info!("Shard {} replaced by repair", id);
            (StatusCode::OK, String::new())
        }
        Err(e) => {
            tracing::error!("Failed to apply repair to {}: {}", id, e);
            (StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}
