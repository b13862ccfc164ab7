//! Bitmap Index Cluster Coordination Library
//!
//! Coordination core of a sharded, replicated bitmap index. Columns are split into
//! fixed-width shards; every shard lives on `N` nodes chosen by a deterministic
//! ownership function. This crate answers who is in the cluster, who owns what, how
//! cluster-wide changes reach everyone and how diverged replicas converge again.
//!
//! ## Architecture Modules
//! - **`shard`**: column to shard arithmetic and shard identities.
//! - **`membership`**: discovery through a pluggable `NodeSet` (static, HTTP, gossip).
//! - **`broadcast`**: schema and topology event dissemination (HTTP, gossip, nop).
//! - **`cluster`**: the topology snapshot, rendezvous-hashing ownership and health.
//! - **`storage`**: the shard storage boundary with an in-memory bitmap store.
//! - **`antientropy`**: the background replica repair loop.
//! - **`server`**: wiring and the internal HTTP API.

pub mod antientropy;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod error;
pub mod membership;
pub mod net;
pub mod protocol;
pub mod server;
pub mod shard;
pub mod storage;
