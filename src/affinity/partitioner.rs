use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::membership::types::{ClusterNode, NodeId};

/// Maps keys to partitions and partitions to an ordered list of nodes.
///
/// The first node of an assignment is the primary, the rest are backups.
pub trait AffinityFunction: Send + Sync {
    fn partitions(&self) -> u32;

    fn partition(&self, key: &str) -> u32;

    /// Ordered owners of `partition` among `nodes`; at most `backups + 1` entries.
    fn assign(&self, partition: u32, nodes: &[ClusterNode], backups: usize) -> Vec<NodeId>;
}

/// Rendezvous (highest random weight) hashing.
///
/// Every node gets a pseudo-random weight per partition and the heaviest nodes win.
/// Removing a node only shifts the partitions it held: the next heaviest node takes
/// its place and every other assignment stays where it was.
///
/// Keys and weights use xxh3, whose output is fixed, so nodes built separately agree.
pub struct RendezvousAffinity {
    partitions: u32,
}

impl RendezvousAffinity {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    fn weight(partition: u32, node: &NodeId) -> u64 {
        xxh3_64_with_seed(node.0.as_bytes(), u64::from(partition))
    }
}

impl AffinityFunction for RendezvousAffinity {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn partition(&self, key: &str) -> u32 {
        (xxh3_64(key.as_bytes()) % u64::from(self.partitions)) as u32
    }

    fn assign(&self, partition: u32, nodes: &[ClusterNode], backups: usize) -> Vec<NodeId> {
        let mut weighted: Vec<(u64, &NodeId)> = nodes
            .iter()
            .map(|n| (Self::weight(partition, &n.id), &n.id))
            .collect();

        weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        weighted
            .into_iter()
            .take(backups + 1)
            .map(|(_, id)| id.clone())
            .collect()
    }
}
