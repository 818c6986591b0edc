//! Durable persistence for Raft critical state.
//!
//! - `MemoryPersister`: in-memory blobs with shared handles, for tests
//! - `FilePersister`: two files with CRC32 trailers and atomic replacement

pub mod file;
pub mod memory;
pub mod traits;

pub use traits::{PersistError, Persister};
