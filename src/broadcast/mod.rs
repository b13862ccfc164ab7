//! Event Dissemination
//!
//! Cluster-wide schema and topology events are pushed to every node through a
//! pluggable [`Broadcaster`]:
//!
//! - **`HttpBroadcaster`**: parallel fan-out with per-node retries. Best effort.
//! - **`GossipBroadcaster`**: piggybacks events onto gossip exchanges. Probabilistic,
//!   converges in `O(log n)` rounds.
//! - **`NopBroadcaster`**: does nothing; topology and schema are fixed externally.
//!
//! Callers apply an event locally first and then hand it to the broadcaster, so a
//! broadcaster never delivers an event back to its own node.

pub mod gossip;
pub mod http;
pub mod types;


use async_trait::async_trait;

use crate::config::MembershipKind;
use crate::error::BroadcastError;
use types::{BroadcastReport, ClusterEvent};

pub use gossip::{EventQueue, GossipBroadcaster};
pub use http::HttpBroadcaster;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Starts dissemination and returns without waiting for recipients.
    async fn send(&self, event: ClusterEvent) -> Result<(), BroadcastError>;

    /// Like `send`, but waits for the fan-out where the transport can observe it.
    async fn send_sync(&self, event: ClusterEvent) -> Result<BroadcastReport, BroadcastError>;

    fn kind(&self) -> MembershipKind;
}

/// Broadcaster for statically managed clusters.
pub struct NopBroadcaster;

#[async_trait]
impl Broadcaster for NopBroadcaster {
    async fn send(&self, event: ClusterEvent) -> Result<(), BroadcastError> {
        tracing::trace!("Dropping {} event (static cluster)", event.kind());
        Ok(())
    }

    async fn send_sync(&self, _event: ClusterEvent) -> Result<BroadcastReport, BroadcastError> {
        Ok(BroadcastReport::default())
    }

    fn kind(&self) -> MembershipKind {
        MembershipKind::Static
    }
}
