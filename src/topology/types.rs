use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::membership::discovery::DiscoveryKind;
use crate::membership::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Being filled; not yet a full copy.
    Moving,
    /// Full copy, may serve reads and act as a preload source.
    Owning,
    /// No longer assigned here; waiting for in-flight work to drain.
    Renting,
    /// Drained and emptied; about to be removed.
    Evicted,
}

impl PartitionState {
    pub fn is_active(self) -> bool {
        matches!(self, PartitionState::Moving | PartitionState::Owning)
    }
}

/// Identity of one topology transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId {
    pub topology_version: u64,
    /// Node whose join or departure caused the exchange.
    pub node: NodeId,
    pub kind: DiscoveryKind,
}

impl ExchangeId {
    pub fn is_joined(&self) -> bool {
        self.kind == DiscoveryKind::Joined
    }
}

impl PartialOrd for ExchangeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExchangeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology_version
            .cmp(&other.topology_version)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ver={}, node={}, {:?}]", self.topology_version, self.node, self.kind)
    }
}

/// Partition states held by one node, stamped with that node's update sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    pub node: NodeId,
    pub update_seq: u64,
    pub states: BTreeMap<u32, PartitionState>,
}

impl PartitionMap {
    pub fn new(node: NodeId, update_seq: u64) -> Self {
        Self {
            node,
            update_seq,
            states: BTreeMap::new(),
        }
    }

    pub fn state(&self, partition: u32) -> Option<PartitionState> {
        self.states.get(&partition).copied()
    }
}

/// Partition maps of every node.
///
/// `author` is the oldest node that built this map. A map without an author was
/// assembled from single-node updates and is not yet valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FullPartitionMap {
    pub author: Option<NodeId>,
    pub author_order: u64,
    pub update_seq: u64,
    pub maps: BTreeMap<NodeId, PartitionMap>,
}

impl FullPartitionMap {
    pub fn new(author: NodeId, author_order: u64, update_seq: u64) -> Self {
        Self {
            author: Some(author),
            author_order,
            update_seq,
            maps: BTreeMap::new(),
        }
    }

    /// Re-authors `other` under a new oldest node.
    pub fn copy_from(author: NodeId, author_order: u64, update_seq: u64, other: &FullPartitionMap) -> Self {
        Self {
            author: Some(author),
            author_order,
            update_seq,
            maps: other.maps.clone(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.author.is_some()
    }

    /// Maps written by a younger authority, or later by the same one, sort after.
    pub fn compare(&self, other: &FullPartitionMap) -> Ordering {
        self.author_order
            .cmp(&other.author_order)
            .then_with(|| self.update_seq.cmp(&other.update_seq))
    }

    pub fn state(&self, node: &NodeId, partition: u32) -> Option<PartitionState> {
        self.maps.get(node).and_then(|m| m.state(partition))
    }
}
