//! Membership & Discovery Module
//!
//! A [`NodeSet`] tells the cluster which nodes exist. Three providers are available:
//!
//! - **`StaticNodeSet`**: the configured list, nothing else. For clusters whose topology
//!   is managed by an orchestrator.
//! - **`HttpNodeSet`**: explicit registration with every peer over HTTP. No failure
//!   detection; departed nodes are removed by reconfiguration.
//! - **`GossipNodeSet`**: a SWIM-like UDP protocol with periodic state exchange,
//!   incarnation-ordered merges and a suspect/dead failure detector.
//!
//! ## Failure semantics
//! Static and HTTP joins fail hard on unreachable peers or a shard-width mismatch.
//! Gossip treats silence as a liveness signal and always returns from `join` within
//! its join timeout.

pub mod gossip;
pub mod http;
pub mod types;


use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::MembershipKind;
use crate::error::MembershipError;
use types::Node;

pub use gossip::GossipNodeSet;
pub use http::HttpNodeSet;

#[async_trait]
pub trait NodeSet: Send + Sync {
    async fn join(&self, initial: Vec<Node>) -> Result<(), MembershipError>;

    /// Last known members, sorted by host.
    fn nodes(&self) -> Vec<Node>;

    fn kind(&self) -> MembershipKind;

    /// Peers refused because of a shard-width mismatch, with the width they advertised.
    fn rejected_peers(&self) -> Vec<(String, u32)> {
        Vec::new()
    }

    /// Called whenever this node adopts a new replica factor, so peers see it.
    fn advertise_replica_factor(&self, _replica_n: usize) {}

    /// Records that `peers` have adopted `replica_n`. Only needed by node sets that
    /// cannot learn it from the peers themselves.
    fn peers_resized(&self, _peers: &[Node], _replica_n: usize) {}
}

#[derive(Default)]
pub struct StaticNodeSet {
    nodes: RwLock<Vec<Node>>,
}

impl StaticNodeSet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeSet for StaticNodeSet {
    async fn join(&self, initial: Vec<Node>) -> Result<(), MembershipError> {
        let mut nodes = initial;
        nodes.sort();
        nodes.dedup();
        tracing::info!("Static node set with {} node(s)", nodes.len());
        *self.nodes.write() = nodes;
        Ok(())
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    fn kind(&self) -> MembershipKind {
        MembershipKind::Static
    }
}
