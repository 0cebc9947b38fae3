use crate::journal::{JournalEntry, LevelJournal};
use crate::layout::{StateLayout, STATE_FORMAT_VERSION};
use crate::snapshot::{CommitBatch, Snapshot};
use crate::StoreError;
use std::fs;
use std::sync::Mutex;
use tracing::debug;

/// Load/commit contract driven by the executor.
///
/// `commit` must be all-or-nothing for its batch and durable before it
/// returns. The executor is the only writer during a run; implementations
/// still serialize commits internally.
pub trait StateStore: Send + Sync {
    /// The last committed snapshot, or an empty one if nothing was applied yet.
    fn load(&self) -> Result<Snapshot, StoreError>;

    /// Start a new apply run and return its sequence number.
    fn begin_run(&self) -> Result<u64, StoreError>;

    /// Record the steps of a level before they are dispatched.
    fn begin_level(&self, _run_seq: u64, _level: usize, _steps: &[String]) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;

    /// Levels interrupted by a crash in a previous run.
    fn recover(&self) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(Vec::new())
    }
}

/// Snapshot persisted as a checksummed JSON document under a [`StateLayout`].
pub struct FileStateStore {
    layout: StateLayout,
    journal: LevelJournal,
    writer: Mutex<()>,
}

impl FileStateStore {
    pub fn new(layout: StateLayout) -> Self {
        let journal = LevelJournal::new(&layout);
        Self {
            layout,
            journal,
            writer: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn read(&self) -> Result<Snapshot, StoreError> {
        let path = self.layout.snapshot_path();
        if !path.exists() {
            return Ok(Snapshot::empty());
        }
        let content = fs::read_to_string(&path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.format_version != STATE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: snapshot.format_version,
            });
        }
        snapshot.verify_checksum()?;
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &mut Snapshot) -> Result<(), StoreError> {
        snapshot.checksum = None;
        snapshot.checksum = Some(snapshot.compute_checksum()?);
        let content = serde_json::to_string_pretty(snapshot)?;
        crate::write_atomic(
            &self.layout.state_dir(),
            &self.layout.snapshot_path(),
            content.as_bytes(),
        )
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        self.read()
    }

    fn begin_run(&self) -> Result<u64, StoreError> {
        let _guard = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        self.layout.initialize()?;
        let mut snapshot = self.read()?;
        snapshot.run_seq += 1;
        self.persist(&mut snapshot)?;
        debug!("begin run {}", snapshot.run_seq);
        Ok(snapshot.run_seq)
    }

    fn begin_level(&self, run_seq: u64, level: usize, steps: &[String]) -> Result<(), StoreError> {
        self.journal.begin(run_seq, level, steps)?;
        Ok(())
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let _guard = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        if !batch.is_empty() {
            let mut snapshot = self.read()?;
            snapshot.apply(batch)?;
            self.persist(&mut snapshot)?;
            debug!(
                "committed level {} of run {}: {} change(s), commit_seq {}",
                batch.level,
                batch.run_seq,
                batch.len(),
                snapshot.commit_seq
            );
        }
        self.journal.complete(batch.run_seq, batch.level)
    }

    fn recover(&self) -> Result<Vec<JournalEntry>, StoreError> {
        self.journal.recover()
    }
}

/// In-memory store for dry runs and tests.
///
/// `fail_commits_after(n)` lets the first `n` commits succeed and rejects
/// every later one, to exercise state-store failure handling.
#[derive(Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Snapshot>,
    commits: Mutex<Vec<CommitBatch>>,
    fail_after: Option<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fail_commits_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Every batch committed so far, in commit order.
    pub fn commits(&self) -> Vec<CommitBatch> {
        self.commits
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Poisoned)
    }

    fn begin_run(&self) -> Result<u64, StoreError> {
        let mut snapshot = self.snapshot.lock().map_err(|_| StoreError::Poisoned)?;
        snapshot.run_seq += 1;
        Ok(snapshot.run_seq)
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let mut commits = self.commits.lock().map_err(|_| StoreError::Poisoned)?;
        if self.fail_after.is_some_and(|n| commits.len() >= n) {
            return Err(StoreError::Io(std::io::Error::other(
                "injected commit failure",
            )));
        }
        let mut snapshot = self.snapshot.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = snapshot.clone();
        next.apply(batch)?;
        *snapshot = next;
        commits.push(batch.clone());
        Ok(())
    }
}
