//! Affinity Module
//!
//! Decides which nodes own a partition at a given topology version.
//!
//! - **`partitioner`**: the pluggable `AffinityFunction` and its rendezvous-hashing default.
//! - **`snapshot`**: member lists per topology version (`DiscoveryCache`).
//! - **`assignment`**: per-version memoized assignments (`AffinityCache`).

pub mod assignment;
pub mod partitioner;
pub mod snapshot;
