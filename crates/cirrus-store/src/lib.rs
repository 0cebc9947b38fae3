//! Durable state for Cirrus: the last applied snapshot, the level journal,
//! and integrity verification.
//!
//! `StateLayout` owns the on-disk directory structure, `Snapshot` is the
//! persisted record of applied resources and bindings, `StateStore` is the
//! load/commit contract the executor drives (with a file-backed and an
//! in-memory implementation), and `LevelJournal` records in-flight levels so
//! a crash mid-level is detectable on the next run.

pub mod integrity;
pub mod journal;
pub mod layout;
pub mod snapshot;
pub mod state;

pub use integrity::{verify_state, IntegrityFailure, IntegrityReport};
pub use journal::{JournalEntry, LevelJournal};
pub use layout::{StateLayout, STATE_FORMAT_VERSION};
pub use snapshot::{BindingRecord, CommitBatch, ResourceRecord, Snapshot};
pub use state::{FileStateStore, MemoryStateStore, StateStore};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Atomically replace `dest` (inside `dir`) with `content`.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot checksum mismatch: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("commit for run {batch} does not match current run {current}")]
    StaleRun { batch: u64, current: u64 },
    #[error("state commit rejected: {0}")]
    CommitRejected(String),
    #[error("state lock poisoned")]
    Poisoned,
}
