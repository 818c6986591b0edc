//! Upper-layer state machine
//!
//! - `KeyValueStore`: simple key-value store driven by the replicated log
//! - `KvService`: apply-channel consumer wiring the store to a node
//! - `TestStateMachine`: records commands for testing

pub mod kv;
pub mod service;
pub mod traits;

pub use kv::{KeyValueStore, Op};
pub use service::{KvError, KvService};
pub use traits::{AppliedCommands, ApplyResult, Snapshotable, StateMachine, TestStateMachine};
