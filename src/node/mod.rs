//! Cache Node Module
//!
//! Wires the topology, exchange and transaction layers of one node together and
//! exposes them over HTTP.
//!
//! ## Core Concepts
//! - **Context**: `CacheContext` holds what every component shares: config, affinity,
//!   the partition topology, the version barrier and the outstanding request table.
//! - **Dispatch**: inbound envelopes are either responses, completing a waiting request,
//!   or requests, handled on their own task and answered to the sender.
//! - **Reads**: keys are read from their primary, falling back to the other owners;
//!   non-owners keep near copies that primaries keep current.

pub mod context;
pub mod handlers;
#[allow(clippy::module_inception)]
pub mod node;
pub mod reads;

#[cfg(test)]
pub(crate) mod testkit;
#[cfg(test)]
mod tests;
