//! Node Wiring
//!
//! Builds one node from a [`ClusterConfig`]:
//!
//! 1. Validate the configuration and normalize the local host.
//! 2. Create the cluster state and pick the node set / broadcaster pair for the
//!    configured membership kind (gossip also attaches the broadcaster to the node set).
//! 3. Serve the internal API ([`Server::router`]), then [`Server::start`] the background
//!    loops and join the cluster.
//!
//! The API must be reachable before `start`: with HTTP membership, peers register with
//! each other while joining.

pub mod handlers;

#[cfg(test)]
mod tests;

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::antientropy::{HttpReplicaClient, Repairer};
use crate::broadcast::{Broadcaster, GossipBroadcaster, HttpBroadcaster, NopBroadcaster};
use crate::cluster::{Cluster, ClusterState};
use crate::config::{ClusterConfig, MembershipKind, host_part};
use crate::error::ServerError;
use crate::membership::types::Node;
use crate::membership::{GossipNodeSet, HttpNodeSet, NodeSet, StaticNodeSet};
use crate::protocol::{ENDPOINT_HEALTH, ENDPOINT_JOIN, ENDPOINT_MESSAGE, ENDPOINT_NODES};
use crate::storage::ShardStore;
use handlers::{
    ApiContext, handle_digest, handle_fetch, handle_health, handle_join, handle_message,
    handle_nodes, handle_push,
};

/// The node set and broadcaster for one membership kind, plus typed handles to the
/// concrete variants that need extra wiring.
pub struct Membership {
    pub node_set: Arc<dyn NodeSet>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub gossip: Option<Arc<GossipNodeSet>>,
    pub http: Option<Arc<HttpNodeSet>>,
}

pub async fn build_membership(
    kind: MembershipKind,
    config: &ClusterConfig,
    state: &Arc<ClusterState>,
) -> Result<Membership, ServerError> {
    let membership = match kind {
        MembershipKind::Static => Membership {
            node_set: Arc::new(StaticNodeSet::new()),
            broadcaster: Arc::new(NopBroadcaster),
            gossip: None,
            http: None,
        },

        MembershipKind::Http => {
            let node_set = Arc::new(HttpNodeSet::new(
                state.local().clone(),
                state.shard_width(),
                config.replicas,
                config.http.clone(),
            ));
            Membership {
                node_set: node_set.clone(),
                broadcaster: Arc::new(HttpBroadcaster::new(state.clone(), config.http.clone())),
                gossip: None,
                http: Some(node_set),
            }
        }

        MembershipKind::Gossip => {
            let local = &state.local().host;
            let bind_addr = resolve(&format!("{}:{}", host_part(local), config.gossip.port)).await?;
            let mut seeds = Vec::new();
            if let Some(seed) = &config.gossip.seed {
                seeds.push(resolve(seed).await?);
            }

            let node_set = GossipNodeSet::new(
                local.clone(),
                bind_addr,
                seeds,
                config.gossip.clone(),
                state.shard_width(),
                config.replicas,
            )
            .await?;
            let broadcaster = Arc::new(GossipBroadcaster::new(state.clone(), node_set.queue()));
            node_set.attach_broadcaster(broadcaster.clone());

            Membership {
                node_set: node_set.clone(),
                broadcaster,
                gossip: Some(node_set),
                http: None,
            }
        }
    };

    tracing::info!("Membership: {:?}", kind);
    Ok(membership)
}

async fn resolve(addr: &str) -> Result<SocketAddr, ServerError> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ServerError::Unresolvable(addr.to_string()))
}

pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route(ENDPOINT_JOIN, post(handle_join))
        .route(ENDPOINT_MESSAGE, post(handle_message))
        .route(ENDPOINT_NODES, get(handle_nodes))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(
            "/internal/shards/:index/:field/:shard/digest",
            get(handle_digest),
        )
        .route(
            "/internal/shards/:index/:field/:shard",
            get(handle_fetch).post(handle_push),
        )
        .layer(Extension(ctx))
}

pub struct Server {
    cluster: Arc<Cluster>,
    store: Arc<dyn ShardStore>,
    repairer: Arc<Repairer>,
    membership: Membership,
    initial: Vec<Node>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub async fn new(config: ClusterConfig, store: Arc<dyn ShardStore>) -> Result<Self, ServerError> {
        let host = config.validate()?;
        let kind = config.membership_kind()?;
        let shard_width = config.shard_width()?;
        let initial: Vec<Node> = config.node_hosts()?.into_iter().map(Node::new).collect();

        tracing::info!(
            "Node {} (shard width 2^{}, {} replica(s))",
            host,
            shard_width.exponent(),
            config.replicas
        );

        let state = ClusterState::new(Node::new(host), Vec::new(), config.replicas, shard_width);
        let membership = build_membership(kind, &config, &state).await?;
        let cluster = Arc::new(Cluster::new(
            state,
            membership.node_set.clone(),
            membership.broadcaster.clone(),
        ));

        let client = Arc::new(HttpReplicaClient::new(
            config.anti_entropy.peer_timeout(),
            config.http.retries,
        ));
        let repairer = Repairer::new(
            cluster.clone(),
            store.clone(),
            client,
            config.anti_entropy.clone(),
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            cluster,
            store,
            repairer,
            membership,
            initial,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn repairer(&self) -> &Arc<Repairer> {
        &self.repairer
    }

    pub fn gossip(&self) -> Option<&Arc<GossipNodeSet>> {
        self.membership.gossip.as_ref()
    }

    pub fn router(&self) -> Router {
        router(Arc::new(ApiContext {
            cluster: self.cluster.clone(),
            store: self.store.clone(),
            http_node_set: self.membership.http.clone(),
        }))
    }

    /// Starts the background loops and joins the cluster. Join failures of the static
    /// and HTTP variants are returned; gossip only fails on a shard-width mismatch.
    pub async fn start(&self) -> Result<(), ServerError> {
        if let Some(gossip) = &self.membership.gossip {
            let handles = gossip.start(self.shutdown.subscribe());
            self.handles.lock().extend(handles);
        }

        self.cluster.join(self.initial.clone()).await?;

        if let Some(handle) = self.repairer.start(self.shutdown.subscribe()) {
            self.handles.lock().push(handle);
        }

        tracing::info!("Node {} started", self.cluster.local_node());
        Ok(())
    }

    /// Signals every background loop and waits for them to exit.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Node {} stopped", self.cluster.local_node());
    }
}
