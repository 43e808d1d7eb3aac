//! Partition Topology Module
//!
//! Tracks which node holds which partition, and in which state, as the cluster changes.
//!
//! ## Core Concepts
//! - **Local Partitions**: `LocalPartition` owns the entries and key locks of one partition
//!   and walks MOVING -> OWNING -> RENTING -> EVICTED.
//! - **Partition Maps**: every node publishes a `PartitionMap`; the oldest node merges them
//!   into the authoritative `FullPartitionMap` and broadcasts it.
//! - **Evictions**: a partition affinity moved away is rented once its new owners hold it,
//!   and evicted when the last reservation drains.

pub mod partition;
#[allow(clippy::module_inception)]
pub mod topology;
pub mod types;
