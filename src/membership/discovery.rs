//! Versioned discovery events.
//!
//! The cache core reacts to membership changes only through [`DiscoveryEvent`]s. Each
//! event carries the topology version it produces and the full member list at that
//! version, so a joining node learns the whole cluster from its own join event.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::service::MembershipService;
use super::types::{ClusterNode, MembershipEvent, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryKind {
    Joined,
    Left,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryKind,
    pub node: ClusterNode,
    pub topology_version: u64,
    /// Members alive after this event, oldest first.
    pub topology: Vec<ClusterNode>,
}

impl DiscoveryEvent {
    pub fn is_departure(&self) -> bool {
        matches!(self.kind, DiscoveryKind::Left | DiscoveryKind::Failed)
    }
}

fn sort_by_order(nodes: &mut [ClusterNode]) {
    nodes.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
}

struct StaticState {
    version: u64,
    next_order: u64,
    members: Vec<ClusterNode>,
    listeners: Vec<(NodeId, mpsc::UnboundedSender<DiscoveryEvent>)>,
}

/// In-process discovery with a single global version counter.
///
/// Every event is delivered to every live listener in the same order, which is the
/// guarantee a ring-based discovery layer gives the cache core.
#[derive(Clone)]
pub struct StaticDiscovery {
    state: Arc<Mutex<StaticState>>,
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StaticState {
                version: 0,
                next_order: 1,
                members: Vec::new(),
                listeners: Vec::new(),
            })),
        }
    }

    /// Next join order to hand out; nodes built for this discovery use it as `order`.
    pub fn next_order(&self) -> u64 {
        let mut state = self.state.lock();
        let order = state.next_order;
        state.next_order += 1;
        order
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn members(&self) -> Vec<ClusterNode> {
        self.state.lock().members.clone()
    }

    /// Adds `node` and delivers the join event to everyone, the joiner included.
    pub fn join(
        &self,
        node: ClusterNode,
        listener: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> DiscoveryEvent {
        let mut state = self.state.lock();
        state.members.push(node.clone());
        sort_by_order(&mut state.members);
        state.listeners.push((node.id.clone(), listener));
        Self::publish(&mut state, DiscoveryKind::Joined, node)
    }

    pub fn fail(&self, id: &NodeId) -> Option<DiscoveryEvent> {
        self.depart(id, DiscoveryKind::Failed)
    }

    pub fn leave(&self, id: &NodeId) -> Option<DiscoveryEvent> {
        self.depart(id, DiscoveryKind::Left)
    }

    fn depart(&self, id: &NodeId, kind: DiscoveryKind) -> Option<DiscoveryEvent> {
        let mut state = self.state.lock();
        let idx = state.members.iter().position(|n| &n.id == id)?;
        let node = state.members.remove(idx);
        state.listeners.retain(|(listener_id, _)| listener_id != id);
        Some(Self::publish(&mut state, kind, node))
    }

    fn publish(state: &mut StaticState, kind: DiscoveryKind, node: ClusterNode) -> DiscoveryEvent {
        state.version += 1;
        let event = DiscoveryEvent {
            kind,
            node,
            topology_version: state.version,
            topology: state.members.clone(),
        };
        state
            .listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        event
    }
}

/// Turns gossip membership events into versioned discovery events.
///
/// Versions are counted locally; gossip does not promise that every node observes
/// membership changes in the same order.
pub fn bridge_gossip(
    membership: Arc<MembershipService>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = membership.subscribe();

    // The local join comes first so the node can start its own exchange.
    let mut version = 1;
    let _ = events.send(DiscoveryEvent {
        kind: DiscoveryKind::Joined,
        node: membership.local_node.cluster_node(),
        topology_version: version,
        topology: membership.cluster_nodes(),
    });

    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Discovery bridge lagged by {} membership events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let (kind, node) = match event {
                MembershipEvent::Joined(node) => (DiscoveryKind::Joined, node),
                MembershipEvent::Left(node) => (DiscoveryKind::Left, node),
                MembershipEvent::Failed(node) => (DiscoveryKind::Failed, node),
            };

            version += 1;
            let discovery_event = DiscoveryEvent {
                kind,
                node: node.cluster_node(),
                topology_version: version,
                topology: membership.cluster_nodes(),
            };

            if events.send(discovery_event).is_err() {
                break;
            }
        }
    })
}
