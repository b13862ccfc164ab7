//! Cluster Coordination Module
//!
//! Owns the answer to "which nodes hold shard S": a published [`state::Topology`]
//! snapshot plus the rendezvous-hashing ownership function in [`placement`].
//!
//! ## Components
//! - **`state`**: the snapshot cell and the schema, both mutated only by applying
//!   [`crate::broadcast::types::ClusterEvent`]s.
//! - **`placement`**: pure `(shard, nodes, N) -> owners`.
//! - **`service`**: the [`Cluster`] facade that ties a node set and a broadcaster to the
//!   state and reports topology hazards through [`health::HealthReport`].

pub mod health;
pub mod placement;
pub mod service;
pub mod state;

#[cfg(test)]
mod tests;

pub use health::{HealthReport, HealthWarning};
pub use service::Cluster;
pub use state::{ClusterState, Topology};
