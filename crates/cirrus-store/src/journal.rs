use crate::layout::StateLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A level whose steps were dispatched but whose commit has not landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op_id: String,
    pub run_seq: u64,
    pub level: usize,
    pub steps: Vec<String>,
    pub timestamp: String,
}

/// Journal of in-flight levels.
///
/// The executor writes an entry before dispatching a level and the state
/// store removes it once the level's commit is durable. An entry found on
/// startup means the process died mid-level: the listed steps may have
/// remote side effects that the snapshot does not record. Re-planning treats
/// them as not applied, which is safe because adapter operations are
/// idempotent.
pub struct LevelJournal {
    journal_dir: PathBuf,
}

impl LevelJournal {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            journal_dir: layout.journal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.journal_dir)?;
        Ok(())
    }

    /// Record that `steps` of `level` are about to be dispatched.
    pub fn begin(&self, run_seq: u64, level: usize, steps: &[String]) -> Result<String, StoreError> {
        let op_id = format!("run{run_seq:08}-level{level:04}");
        let entry = JournalEntry {
            op_id: op_id.clone(),
            run_seq,
            level,
            steps: steps.to_vec(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&entry)?;
        crate::write_atomic(&self.journal_dir, &self.entry_path(&op_id), content.as_bytes())?;
        debug!("journal begin: level {level} of run {run_seq} ({} steps)", steps.len());
        Ok(op_id)
    }

    /// Remove the entry for a level after its commit is durable.
    pub fn complete(&self, run_seq: u64, level: usize) -> Result<(), StoreError> {
        let op_id = format!("run{run_seq:08}-level{level:04}");
        let path = self.entry_path(&op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            crate::fsync_dir(&self.journal_dir)?;
            debug!("journal complete: {op_id}");
        }
        Ok(())
    }

    pub fn list_incomplete(&self) -> Result<Vec<JournalEntry>, StoreError> {
        if !self.journal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.journal_dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<JournalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt journal entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable journal entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.op_id.cmp(&b.op_id));
        Ok(entries)
    }

    /// Drain incomplete entries, returning them for reporting.
    pub fn recover(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let entries = self.list_incomplete()?;
        for entry in &entries {
            warn!(
                "interrupted level {} of run {}: outcome of {} step(s) unknown, they will be re-planned",
                entry.level,
                entry.run_seq,
                entry.steps.len()
            );
            let _ = fs::remove_file(self.entry_path(&entry.op_id));
        }
        if !entries.is_empty() {
            info!("journal recovery complete: {} interrupted level(s)", entries.len());
        }
        Ok(entries)
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.journal_dir.join(format!("{op_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, LevelJournal) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        layout.initialize().unwrap();
        let journal = LevelJournal::new(&layout);
        journal.initialize().unwrap();
        (dir, journal)
    }

    #[test]
    fn begin_creates_entry() {
        let (_dir, journal) = setup();
        journal.begin(1, 0, &["role".to_owned()]).unwrap();
        let entries = journal.list_incomplete().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].steps, vec!["role".to_owned()]);
        assert_eq!(entries[0].level, 0);
    }

    #[test]
    fn complete_removes_entry() {
        let (_dir, journal) = setup();
        journal.begin(1, 0, &[]).unwrap();
        journal.complete(1, 0).unwrap();
        assert!(journal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn complete_without_entry_is_noop() {
        let (_dir, journal) = setup();
        journal.complete(7, 3).unwrap();
    }

    #[test]
    fn entries_are_listed_in_level_order() {
        let (_dir, journal) = setup();
        journal.begin(2, 10, &[]).unwrap();
        journal.begin(2, 2, &[]).unwrap();
        let levels: Vec<usize> = journal
            .list_incomplete()
            .unwrap()
            .iter()
            .map(|e| e.level)
            .collect();
        assert_eq!(levels, vec![2, 10]);
    }

    #[test]
    fn recover_drains_entries() {
        let (_dir, journal) = setup();
        journal.begin(3, 1, &["fn".to_owned(), "grant:fn->b".to_owned()]).unwrap();
        let recovered = journal.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].steps.len(), 2);
        assert!(journal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn corrupt_entry_is_removed() {
        let (dir, journal) = setup();
        let path = dir.path().join("state").join("journal").join("bad.json");
        fs::write(&path, "NOT JSON{{").unwrap();
        assert!(journal.list_incomplete().unwrap().is_empty());
        assert!(!path.exists());
    }
}
