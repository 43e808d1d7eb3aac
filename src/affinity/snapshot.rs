use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::membership::types::{ClusterNode, NodeId};

const SNAPSHOT_HISTORY: usize = 64;

/// Members alive at one topology version, oldest first.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub version: u64,
    pub nodes: Vec<ClusterNode>,
}

impl TopologySnapshot {
    pub fn new(version: u64, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Self { version, nodes }
    }

    pub fn oldest(&self) -> Option<&ClusterNode> {
        self.nodes.first()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}

/// History of topology snapshots plus the set of nodes known to have departed.
pub struct DiscoveryCache {
    local: ClusterNode,
    snapshots: RwLock<BTreeMap<u64, Arc<TopologySnapshot>>>,
    departed: DashMap<NodeId, u64>,
}

impl DiscoveryCache {
    pub fn new(local: ClusterNode) -> Self {
        Self {
            local,
            snapshots: RwLock::new(BTreeMap::new()),
            departed: DashMap::new(),
        }
    }

    pub fn local(&self) -> &ClusterNode {
        &self.local
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.id
    }

    /// Records a snapshot. Versions already present are never overwritten.
    pub fn install(&self, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
        let mut snapshots = self.snapshots.write();
        let snapshot = snapshots
            .entry(snapshot.version)
            .or_insert_with(|| Arc::new(snapshot))
            .clone();

        while snapshots.len() > SNAPSHOT_HISTORY {
            snapshots.pop_first();
        }

        snapshot
    }

    pub fn snapshot(&self, version: u64) -> Option<Arc<TopologySnapshot>> {
        self.snapshots.read().get(&version).cloned()
    }

    pub fn latest(&self) -> Option<Arc<TopologySnapshot>> {
        self.snapshots.read().values().next_back().cloned()
    }

    pub fn version(&self) -> u64 {
        self.snapshots.read().keys().next_back().copied().unwrap_or(0)
    }

    pub fn mark_departed(&self, id: &NodeId, version: u64) {
        self.departed.insert(id.clone(), version);
    }

    pub fn has_departed(&self, id: &NodeId) -> bool {
        self.departed.contains_key(id)
    }

    /// Alive means present in the latest snapshot and not reported gone since.
    pub fn alive(&self, id: &NodeId) -> bool {
        !self.has_departed(id) && self.latest().is_some_and(|s| s.contains(id))
    }

    /// Looks a node up in the most recent snapshot that still knows it.
    pub fn node(&self, id: &NodeId) -> Option<ClusterNode> {
        if id == &self.local.id {
            return Some(self.local.clone());
        }
        self.snapshots
            .read()
            .values()
            .rev()
            .find_map(|s| s.node(id).cloned())
    }

    /// Join order of a node, or `u64::MAX` when unknown (sorts as the newest).
    pub fn order(&self, id: &NodeId) -> u64 {
        self.node(id).map(|n| n.order).unwrap_or(u64::MAX)
    }

    pub fn oldest(&self, version: u64) -> Option<ClusterNode> {
        self.snapshot(version).and_then(|s| s.oldest().cloned())
    }

    pub fn is_oldest(&self, version: u64) -> bool {
        self.oldest(version).is_some_and(|n| n.id == self.local.id)
    }
}
