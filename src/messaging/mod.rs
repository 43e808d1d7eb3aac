//! Messaging Module
//!
//! Node-to-node communication for the cache core.
//!
//! ## Components
//! - **Protocol**: every request, response and one-way message, wrapped in an `Envelope`.
//! - **Transport**: `Transport` trait with an HTTP implementation for real clusters and an
//!   in-process `LocalHub` for tests.
//! - **Futures**: `MiniFutures` matches responses to the request that is waiting on them.

pub mod futures;
pub mod protocol;
pub mod transport;
