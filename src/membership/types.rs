use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "{}", short)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    /// Left the cluster on purpose (graceful shutdown).
    Left,
}

/// A gossip member.
///
/// `order` is fixed when the node starts and never changes, so every member agrees on
/// which node joined first. The `incarnation` field is a logical clock used to refute
/// a false "Suspect" claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub order: u64,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    pub fn cluster_node(&self) -> ClusterNode {
        ClusterNode {
            id: self.id.clone(),
            order: self.order,
            addr: self.http_addr,
        }
    }
}

/// The view of a member the cache core works with: identity, join order and the
/// address its message endpoint listens on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClusterNode {
    pub id: NodeId,
    pub order: u64,
    pub addr: SocketAddr,
}

/// Gossip wire protocol.
///
/// - `Ping/Ack`: liveness checks and state synchronization.
/// - `Join`: sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: disseminates changes in node health.
/// - `Leave`: graceful departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
    },
}

/// Membership transitions published by the gossip service.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(Node),
    Left(Node),
    Failed(Node),
}
