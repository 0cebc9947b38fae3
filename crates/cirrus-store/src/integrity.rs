use crate::journal::LevelJournal;
use crate::layout::StateLayout;
use crate::snapshot::Snapshot;
use crate::StoreError;
use serde::Serialize;
use std::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
    /// Levels left in the journal by an interrupted run.
    pub interrupted_levels: usize,
}

#[derive(Debug, Serialize)]
pub struct IntegrityFailure {
    pub item: String,
    pub reason: String,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn check(&mut self, item: impl Into<String>, result: Result<(), String>) {
        self.checked += 1;
        match result {
            Ok(()) => self.passed += 1,
            Err(reason) => self.failed.push(IntegrityFailure {
                item: item.into(),
                reason,
            }),
        }
    }
}

/// Check the state directory without modifying it: format version, snapshot
/// checksum, and referential integrity of the recorded dependencies and
/// bindings.
pub fn verify_state(layout: &StateLayout) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport {
        checked: 0,
        passed: 0,
        failed: Vec::new(),
        interrupted_levels: 0,
    };

    if layout.state_dir().join("version").exists() {
        report.check("version", layout.verify_version().map_err(|e| e.to_string()));
    }

    let path = layout.snapshot_path();
    if !path.exists() {
        info!("no snapshot at {}; nothing applied yet", path.display());
    } else {
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<Snapshot>(&content) {
            Err(e) => report.check("snapshot", Err(format!("unparseable: {e}"))),
            Ok(snapshot) => {
                let checksum = match snapshot.checksum {
                    None => Err("checksum missing".to_owned()),
                    Some(_) => snapshot.verify_checksum().map_err(|e| e.to_string()),
                };
                report.check("snapshot", checksum);
                check_references(&snapshot, &mut report);
            }
        }
    }

    report.interrupted_levels = LevelJournal::new(layout).list_incomplete()?.len();
    if report.interrupted_levels > 0 {
        warn!(
            "{} interrupted level(s) in the journal",
            report.interrupted_levels
        );
    }

    info!(
        "state verification: {}/{} passed",
        report.passed, report.checked
    );
    Ok(report)
}

fn check_references(snapshot: &Snapshot, report: &mut IntegrityReport) {
    for (id, record) in &snapshot.resources {
        let missing: Vec<String> = record
            .depends_on
            .iter()
            .filter(|d| !snapshot.resources.contains_key(*d))
            .map(ToString::to_string)
            .collect();
        let result = if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("depends on unrecorded resource(s): {}", missing.join(", ")))
        };
        report.check(format!("resource:{id}"), result);
    }
    for (key, record) in &snapshot.bindings {
        let missing: Vec<String> = record
            .binding
            .endpoints()
            .into_iter()
            .filter(|e| !snapshot.resources.contains_key(*e))
            .map(ToString::to_string)
            .collect();
        let result = if record.binding.key() != *key {
            Err(format!("recorded under '{key}' but its key is '{}'", record.binding.key()))
        } else if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("endpoint(s) not recorded: {}", missing.join(", ")))
        };
        report.check(key.clone(), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BindingRecord, CommitBatch, ResourceRecord};
    use crate::state::{FileStateStore, StateStore};
    use cirrus_schema::{Binding, Capability, ConfigHash, Grant, Outputs, ResourceKind};

    fn record(kind: ResourceKind) -> ResourceRecord {
        ResourceRecord {
            kind,
            config_hash: ConfigHash::new("h"),
            outputs: Outputs::new(),
            depends_on: Default::default(),
            input_fingerprint: None,
            applied_run: 1,
            applied_at: String::new(),
        }
    }

    fn populated() -> (tempfile::TempDir, StateLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        let store = FileStateStore::new(layout.clone());
        let run = store.begin_run().unwrap();
        let grant = Binding::Grant(Grant::new("fn", "data", Capability::Read));
        let mut batch = CommitBatch::new(run, 0);
        batch.upserts.push(("data".into(), record(ResourceKind::Bucket)));
        batch.upserts.push(("fn".into(), record(ResourceKind::ComputeFunction)));
        batch.binding_upserts.push((
            grant.key(),
            BindingRecord {
                binding: grant,
                hash: ConfigHash::new("b"),
                applied_run: run,
                applied_at: String::new(),
            },
        ));
        store.commit(&batch).unwrap();
        (dir, layout)
    }

    #[test]
    fn clean_state_passes() {
        let (_dir, layout) = populated();
        let report = verify_state(&layout).unwrap();
        assert!(report.is_clean(), "{:?}", report.failed);
        assert_eq!(report.checked, report.passed);
        assert_eq!(report.interrupted_levels, 0);
    }

    #[test]
    fn empty_state_dir_passes() {
        let dir = tempfile::tempdir().unwrap();
        let report = verify_state(&StateLayout::new(dir.path())).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked, 0);
    }

    #[test]
    fn tampered_snapshot_is_reported() {
        let (_dir, layout) = populated();
        let path = layout.snapshot_path();
        let content = fs::read_to_string(&path)
            .unwrap()
            .replace("\"applied_run\": 1", "\"applied_run\": 7");
        fs::write(&path, content).unwrap();
        let report = verify_state(&layout).unwrap();
        assert!(report.failed.iter().any(|f| f.item == "snapshot"));
    }

    #[test]
    fn dangling_binding_endpoint_is_reported() {
        let (_dir, layout) = populated();
        let path = layout.snapshot_path();
        let mut snapshot: Snapshot =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        snapshot.resources.remove("data");
        snapshot.checksum = Some(snapshot.compute_checksum().unwrap());
        fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let report = verify_state(&layout).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("data"));
    }

    #[test]
    fn interrupted_levels_are_counted() {
        let (_dir, layout) = populated();
        LevelJournal::new(&layout)
            .begin(2, 0, &["fn".to_owned()])
            .unwrap();
        let report = verify_state(&layout).unwrap();
        assert_eq!(report.interrupted_levels, 1);
    }
}
