//! In-memory persister for tests.
//!
//! Clones share the underlying blobs, so a core rebuilt from a clone of
//! its persister observes exactly the bytes written before a simulated
//! crash.

use std::sync::{Arc, Mutex};

use super::{PersistError, Persister};

#[derive(Debug, Default)]
struct Blobs {
    state: Option<Vec<u8>>,
    snapshot: Option<Vec<u8>>,
}

/// Shared in-memory persister.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    blobs: Arc<Mutex<Blobs>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save_state(&mut self, state: &[u8]) -> Result<(), PersistError> {
        self.blobs.lock().unwrap().state = Some(state.to_vec());
        Ok(())
    }

    fn save_state_and_snapshot(
        &mut self,
        state: &[u8],
        snapshot: &[u8],
    ) -> Result<(), PersistError> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.state = Some(state.to_vec());
        blobs.snapshot = Some(snapshot.to_vec());
        Ok(())
    }

    fn read_state(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.blobs.lock().unwrap().state.clone())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.blobs.lock().unwrap().snapshot.clone())
    }

    fn state_size(&self) -> u64 {
        self.blobs
            .lock()
            .unwrap()
            .state
            .as_ref()
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }
}
