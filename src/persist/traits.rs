//! Persister abstraction for Raft durable state.
//!
//! The core hands over two opaque blobs: the serialized raft state
//! (terms, vote, log, snapshot boundary) and the upper layer's snapshot.
//! Both must be durable before the calling operation replies to any RPC.

use thiserror::Error;

/// Errors surfaced by a persister implementation.
#[derive(Debug, Clone, Error)]
pub enum PersistError {
    /// I/O failure (disk full, permission denied, ...)
    #[error("i/o error: {0}")]
    Io(String),
    /// Stored bytes failed validation on read
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Blob store for the two persisted artifacts.
///
/// Writes must be atomic: after a crash a reader sees either the previous
/// blob or the new one, never a mix. `save_state_and_snapshot` updates
/// both artifacts for a snapshot transition.
pub trait Persister: Send {
    /// Durably replace the raft state blob.
    fn save_state(&mut self, state: &[u8]) -> Result<(), PersistError>;

    /// Durably replace both blobs (snapshot transitions).
    fn save_state_and_snapshot(
        &mut self,
        state: &[u8],
        snapshot: &[u8],
    ) -> Result<(), PersistError>;

    /// Read the raft state blob; `None` on first boot.
    fn read_state(&self) -> Result<Option<Vec<u8>>, PersistError>;

    /// Read the snapshot blob; `None` if no snapshot was ever saved.
    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, PersistError>;

    /// Size in bytes of the current raft state blob.
    fn state_size(&self) -> u64;
}
