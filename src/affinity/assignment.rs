use dashmap::DashMap;
use std::sync::Arc;

use super::partitioner::AffinityFunction;
use super::snapshot::DiscoveryCache;
use crate::membership::types::NodeId;

/// Owners of every partition at one topology version.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub version: u64,
    pub partitions: Vec<Vec<NodeId>>,
}

impl Assignment {
    pub fn nodes(&self, partition: u32) -> &[NodeId] {
        self.partitions
            .get(partition as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Memoized affinity per topology version.
pub struct AffinityCache {
    function: Arc<dyn AffinityFunction>,
    backups: usize,
    discovery: Arc<DiscoveryCache>,
    assignments: DashMap<u64, Arc<Assignment>>,
}

impl AffinityCache {
    pub fn new(
        function: Arc<dyn AffinityFunction>,
        backups: usize,
        discovery: Arc<DiscoveryCache>,
    ) -> Self {
        Self {
            function,
            backups,
            discovery,
            assignments: DashMap::new(),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.function.partitions()
    }

    pub fn partition(&self, key: &str) -> u32 {
        self.function.partition(key)
    }

    /// Assignment at `version`, computed on first use from the discovery snapshot.
    pub fn assignment(&self, version: u64) -> Option<Arc<Assignment>> {
        if let Some(existing) = self.assignments.get(&version) {
            return Some(existing.clone());
        }

        let snapshot = self.discovery.snapshot(version)?;
        let partitions = (0..self.function.partitions())
            .map(|p| self.function.assign(p, &snapshot.nodes, self.backups))
            .collect();

        let assignment = Arc::new(Assignment {
            version,
            partitions,
        });

        // Keep whichever copy won a concurrent race; both are identical.
        let stored = self
            .assignments
            .entry(version)
            .or_insert(assignment)
            .clone();

        self.prune(version);
        Some(stored)
    }

    /// Installs an assignment fetched from a peer for a version we never observed.
    pub fn install(&self, assignment: Assignment) {
        self.assignments
            .entry(assignment.version)
            .or_insert_with(|| Arc::new(assignment));
    }

    fn prune(&self, latest: u64) {
        if self.assignments.len() > 64 {
            let floor = latest.saturating_sub(32);
            self.assignments.retain(|v, _| *v >= floor);
        }
    }

    pub fn nodes(&self, partition: u32, version: u64) -> Vec<NodeId> {
        self.assignment(version)
            .map(|a| a.nodes(partition).to_vec())
            .unwrap_or_default()
    }

    pub fn primary(&self, partition: u32, version: u64) -> Option<NodeId> {
        self.assignment(version)
            .and_then(|a| a.nodes(partition).first().cloned())
    }

    pub fn backups(&self, partition: u32, version: u64) -> Vec<NodeId> {
        self.nodes(partition, version).into_iter().skip(1).collect()
    }

    pub fn is_local(&self, partition: u32, version: u64) -> bool {
        self.belongs(partition, version, self.discovery.local_id())
    }

    pub fn belongs(&self, partition: u32, version: u64, node: &NodeId) -> bool {
        self.assignment(version)
            .is_some_and(|a| a.nodes(partition).contains(node))
    }

    pub fn is_primary(&self, partition: u32, version: u64) -> bool {
        self.primary(partition, version).as_ref() == Some(self.discovery.local_id())
    }

    /// Partitions the local node is assigned at `version`.
    pub fn local_partitions(&self, version: u64) -> Vec<u32> {
        let local = self.discovery.local_id();
        match self.assignment(version) {
            Some(a) => (0..self.partitions())
                .filter(|p| a.nodes(*p).contains(local))
                .collect(),
            None => Vec::new(),
        }
    }
}
