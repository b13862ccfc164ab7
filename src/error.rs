//! Error types for the coordination layer.
//!
//! Startup wiring surfaces [`ConfigError`] (and fatal [`MembershipError`]s) to the
//! binary, which exits. Everything raised inside a background loop is logged and
//! dropped at the loop boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown membership variant '{0}' (expected static, http or gossip)")]
    UnknownVariant(String),

    #[error("invalid scheme or host: '{0}'. use the format [http://]<host>:<port>")]
    InvalidHost(String),

    #[error("shard width exponent {0} out of range (16..=32)")]
    ShardWidthOutOfRange(u32),

    #[error("replica factor must be positive")]
    ZeroReplicaFactor,

    #[error("{0} must be positive")]
    ZeroInterval(&'static str),

    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("peer {peer} rejected join: {status}")]
    JoinRejected { peer: String, status: u16 },

    #[error("shard width mismatch with {peer}: theirs {theirs}, ours {ours}")]
    ShardWidthMismatch { peer: String, theirs: u32, ours: u32 },

    #[error("gossip socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("gossip encoding: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("encoding event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("replica factor must be positive")]
    ZeroReplicaFactor,

    #[error("index '{0}' does not exist")]
    UnknownIndex(String),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shard {0} not held locally")]
    MissingShard(String),

    #[error("corrupt shard payload: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("peer {peer} timed out after {millis}ms")]
    Timeout { peer: String, millis: u64 },

    #[error("peer {peer} answered {status}")]
    BadStatus { peer: String, status: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Anything that stops a node from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("resolving {0}: no address")]
    Unresolvable(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
