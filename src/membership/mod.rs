//! Membership & Discovery Module
//!
//! Tracks cluster members and turns membership changes into versioned discovery events
//! that drive partition exchanges.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: UDP ping/ack keeps a shared view of members (SWIM-like).
//! - **Failure Detection**: "Suspect" -> "Dead" transitions on silence, refuted by incarnation numbers.
//! - **Join Order**: every member carries a fixed `order`; the oldest live member is the
//!   authority for the full partition map.
//! - **Discovery Events**: `discovery` versions each join/leave/failure and carries the
//!   member list at that version.

pub mod discovery;
pub mod service;
pub mod types;
