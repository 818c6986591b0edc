//! State machine abstraction.
//!
//! The state machine is the application logic the replicated log drives.
//! Implementations must be deterministic: applying the same commands in
//! the same order produces the same state on every node.

use std::sync::{Arc, Mutex};

/// Result of applying one command: output on success, message on error.
pub type ApplyResult = Result<String, String>;

/// The application logic driven by committed log entries.
pub trait StateMachine: Send {
    /// Apply one command. Commands are the opaque bytes carried by log
    /// entries; decoding them is the state machine's business.
    fn apply(&mut self, command: &[u8]) -> ApplyResult;
}

/// A state machine that supports log compaction.
pub trait Snapshotable: StateMachine {
    /// Serialize the current state.
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with a deserialized snapshot.
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for assertions in tests.
pub type AppliedCommands = Arc<Mutex<Vec<Vec<u8>>>>;

/// Test state machine that records every applied command.
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec to inspect applied commands from outside.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.applied.lock().unwrap().push(command.to_vec());
        Ok(String::new())
    }
}

impl Snapshotable for TestStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let applied = self.applied.lock().unwrap().clone();
        serde_json::to_vec(&applied).map_err(|e| format!("test state machine snapshot: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let applied: Vec<Vec<u8>> = serde_json::from_slice(data)
            .map_err(|e| format!("test state machine restore: {}", e))?;
        *self.applied.lock().unwrap() = applied;
        Ok(())
    }
}
