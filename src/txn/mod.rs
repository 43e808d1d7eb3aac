//! Transaction Module
//!
//! Two-phase transactions over partitioned keys.
//!
//! ## Core Concepts
//! - **Roles**: the near node starts a transaction and routes it, the primary of each key
//!   locks and resolves it, backups and near readers receive the resolved writes.
//! - **Versions**: every transaction and entry carries a `TxVersion`; entries only move
//!   forward in version.
//! - **Failures**: a transaction whose coordinator left is salvaged after an idle
//!   timeout; a store failure after prepare is reported as a heuristic outcome.

pub mod core;
pub mod locks;
pub mod manager;
pub mod near;
pub mod primary;
pub mod remote;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
