use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Instant;

use crate::broadcast::types::EventEnvelope;

/// Version of the join/gossip wire formats.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// Precedence when two updates carry the same incarnation.
    pub fn rank(self) -> u8 {
        match self {
            NodeState::Alive => 0,
            NodeState::Suspect => 1,
            NodeState::Dead => 2,
        }
    }

    /// Alive and suspect members still count towards ownership.
    pub fn is_live(self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

/// What a node advertises about itself alongside its address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMeta {
    pub protocol_version: u32,
    pub state: NodeState,
    pub replica_n: usize,
    pub shard_width: u32,
}

/// A cluster node, identified by its `host:port`.
///
/// Equality, hashing and ordering only look at `host`; `meta` is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub meta: Option<NodeMeta>,
}

impl Node {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: NodeMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host.cmp(&other.host)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// One row of the gossip membership table.
///
/// The `incarnation` field is a logical clock owned by the member itself. Updates
/// are ordered by `(incarnation, state rank)`, so merging is last-write-wins and does
/// not depend on the order updates arrive in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub host: String,
    pub gossip_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,
    pub replica_n: usize,
    pub shard_width: u32,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Member {
    pub fn supersedes(&self, other: &Member) -> bool {
        (self.incarnation, self.state.rank()) > (other.incarnation, other.state.rank())
    }

    pub fn to_node(&self) -> Node {
        Node::new(self.host.clone()).with_meta(NodeMeta {
            protocol_version: PROTOCOL_VERSION,
            state: self.state,
            replica_n: self.replica_n,
            shard_width: self.shard_width,
        })
    }
}

/// The gossip wire protocol (bincode over UDP).
///
/// - `Ping/Ack`: periodic exchange; the ack carries the full member table.
/// - `Join/JoinAck`: entering the cluster through a seed.
/// - `Suspect/Alive`: failure-detector verdicts and their refutations.
///
/// Ping, Ack and JoinAck piggyback cluster events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: Member,
        events: Vec<EventEnvelope>,
    },

    Ack {
        from: Member,
        members: Vec<Member>,
        events: Vec<EventEnvelope>,
    },

    Join {
        member: Member,
    },

    JoinAck {
        from: Member,
        members: Vec<Member>,
    },

    Suspect {
        host: String,
        incarnation: u64,
    },

    Alive {
        host: String,
        incarnation: u64,
    },
}
