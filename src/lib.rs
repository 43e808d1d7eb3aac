//! Partitioned Cache Library
//!
//! A partitioned, replicated in-memory cache with distributed transactions.
//!
//! ## Architecture Modules
//! - **`membership`**: UDP gossip membership and the versioned discovery events the cache
//!   core consumes.
//! - **`affinity`**: maps keys to partitions and partitions to their primary and backup
//!   nodes for each topology version.
//! - **`topology`**: local partitions with their state machine, and the cluster-wide
//!   partition maps.
//! - **`exchange`**: serialized topology transitions, partition map exchange and
//!   preloading of partitions that moved here.
//! - **`messaging`**: the wire protocol, request/response correlation and transports.
//! - **`txn`**: versions, key locks and the near/primary/backup transaction protocol.
//! - **`node`**: the node facade, message dispatch and HTTP handlers.

pub mod affinity;
pub mod config;
pub mod error;
pub mod exchange;
pub mod membership;
pub mod messaging;
pub mod node;
pub mod topology;
pub mod txn;
