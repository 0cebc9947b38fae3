use crate::CoreError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Process holding a state lock, recorded inside the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    /// Engine operation that took the lock, e.g. `apply`.
    pub operation: String,
    pub since: String,
}

impl LockHolder {
    pub fn current(operation: &str) -> Self {
        Self {
            pid: std::process::id(),
            operation: operation.to_owned(),
            since: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} ({} since {})", self.pid, self.operation, self.since)
    }
}

/// Exclusive, non-blocking lock on a state directory for one apply or
/// destroy run. At most one run mutates a state directory at a time.
pub struct StateLock {
    lock_file: File,
}

impl StateLock {
    /// Take the lock and record `holder` in it, or fail with
    /// [`CoreError::StateLocked`] naming whoever holds it.
    pub fn acquire(lock_path: &Path, holder: &LockHolder) -> Result<Self, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        if file.try_lock_exclusive().is_err() {
            let current = read_holder(&mut file).map_or_else(
                || lock_path.display().to_string(),
                |h| format!("{} held by {h}", lock_path.display()),
            );
            return Err(CoreError::StateLocked(current));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&serde_json::to_vec(holder)?)?;
        file.sync_all()?;
        debug!("state lock taken by {holder}");
        Ok(Self { lock_file: file })
    }

    /// Holder recorded in the lock file at `lock_path`, if any.
    pub fn holder(lock_path: &Path) -> Option<LockHolder> {
        let mut file = File::open(lock_path).ok()?;
        read_holder(&mut file)
    }
}

fn read_holder(file: &mut File) -> Option<LockHolder> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // A stale holder is harmless; the flock is what excludes.
        let _ = self.lock_file.set_len(0);
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the executor to stop at the next level boundary; a
/// second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nabort requested, finishing the current level...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
