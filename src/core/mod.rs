//! Consensus core: state, timers, and RPC driving.
//!
//! - `RaftCore`: all Raft state plus the receiver side of the three RPCs
//! - `RaftNode`: the sender side (vote fan-out, heartbeat replication)
//! - `RaftServer`: the election / heartbeat / apply timer loops

pub mod apply;
pub mod config;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;

pub use apply::ApplyMsg;
pub use config::RaftConfig;
pub use raft_core::{RaftCore, Role};
pub use raft_server::{RaftHandle, RaftServer};
