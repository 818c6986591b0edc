//! Raft replication core for a strongly-consistent key/value store.
//!
//! Implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro
//! and John Ousterhout — leader election, log replication, commit
//! advancement, snapshot installation, and durable persistence.

pub mod core;
pub mod persist;
pub mod state_machine;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
