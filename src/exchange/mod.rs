//! Topology Exchange Module
//!
//! Linearizes topology changes on every node.
//!
//! ## Flow
//! 1. A discovery event installs the new topology snapshot and queues an exchange.
//! 2. The exchange worker runs `before_exchange`, then every node sends its partition map
//!    to the oldest node, which merges them and broadcasts the full map.
//! 3. After `after_exchange` the version barrier opens and transactions pinned to that
//!    version are admitted.
//! 4. The preloader fills MOVING partitions from their owners; ownership changes are
//!    pushed to the oldest node, which re-broadcasts the full map.

pub mod coordinator;
pub mod future;
pub mod preloader;

#[cfg(test)]
mod tests;
