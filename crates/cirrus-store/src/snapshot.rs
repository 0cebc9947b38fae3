use crate::layout::STATE_FORMAT_VERSION;
use crate::StoreError;
use cirrus_schema::{Binding, ConfigHash, Outputs, ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the engine knows about one applied resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub config_hash: ConfigHash,
    #[serde(default)]
    pub outputs: Outputs,
    /// Effective dependencies (declared plus implied), kept so deletions can
    /// be ordered after the resource has left the desired spec.
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,
    /// Hash of the dependency outputs substituted into the config when it
    /// was last applied. `None` when the config references no outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_fingerprint: Option<String>,
    pub applied_run: u64,
    pub applied_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub binding: Binding,
    pub hash: ConfigHash,
    pub applied_run: u64,
    pub applied_at: String,
}

/// Persisted record of the last successfully applied state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    /// Incremented at the start of every apply run.
    pub run_seq: u64,
    /// Incremented on every level commit.
    pub commit_seq: u64,
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    #[serde(default)]
    pub bindings: BTreeMap<String, BindingRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// blake3 checksum over the snapshot with this field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// The applied subset of one plan level, persisted all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    pub run_seq: u64,
    pub level: usize,
    pub upserts: Vec<(ResourceId, ResourceRecord)>,
    pub removals: Vec<ResourceId>,
    pub binding_upserts: Vec<(String, BindingRecord)>,
    pub binding_removals: Vec<String>,
}

impl CommitBatch {
    pub fn new(run_seq: u64, level: usize) -> Self {
        Self {
            run_seq,
            level,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.removals.is_empty()
            && self.binding_upserts.is_empty()
            && self.binding_removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len()
            + self.removals.len()
            + self.binding_upserts.len()
            + self.binding_removals.len()
    }
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            run_seq: 0,
            commit_seq: 0,
            resources: BTreeMap::new(),
            bindings: BTreeMap::new(),
            updated_at: None,
            checksum: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.bindings.is_empty()
    }

    pub fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub fn verify_checksum(&self) -> Result<(), StoreError> {
        if let Some(ref expected) = self.checksum {
            let actual = self.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Apply a batch in place.
    ///
    /// Removing a resource also drops it from other records' dependency sets
    /// and drops any binding that still names it, so the snapshot never
    /// references a resource that is no longer applied.
    pub fn apply(&mut self, batch: &CommitBatch) -> Result<(), StoreError> {
        if batch.run_seq != self.run_seq {
            return Err(StoreError::StaleRun {
                batch: batch.run_seq,
                current: self.run_seq,
            });
        }
        for (id, record) in &batch.upserts {
            for dep in &record.depends_on {
                let known = self.resources.contains_key(dep)
                    || batch.upserts.iter().any(|(other, _)| other == dep);
                if !known {
                    return Err(StoreError::CommitRejected(format!(
                        "resource '{id}' depends on '{dep}', which is not applied"
                    )));
                }
            }
        }

        for (id, record) in &batch.upserts {
            self.resources.insert(id.clone(), record.clone());
        }
        for key in &batch.binding_removals {
            self.bindings.remove(key);
        }
        for (key, record) in &batch.binding_upserts {
            self.bindings.insert(key.clone(), record.clone());
        }
        for id in &batch.removals {
            self.resources.remove(id);
        }
        if !batch.removals.is_empty() {
            let removed: BTreeSet<&ResourceId> = batch.removals.iter().collect();
            for record in self.resources.values_mut() {
                record.depends_on.retain(|d| !removed.contains(d));
            }
            self.bindings
                .retain(|_, b| !b.binding.endpoints().iter().any(|e| removed.contains(e)));
        }
        self.commit_seq += 1;
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_schema::{Capability, Grant};

    fn record(kind: ResourceKind, hash: &str, deps: &[&str]) -> ResourceRecord {
        ResourceRecord {
            kind,
            config_hash: ConfigHash::new(hash),
            outputs: Outputs::new(),
            depends_on: deps.iter().map(|d| ResourceId::from(*d)).collect(),
            input_fingerprint: None,
            applied_run: 1,
            applied_at: "2025-01-01T00:00:00Z".to_owned(),
        }
    }

    fn snapshot_at_run(run: u64) -> Snapshot {
        Snapshot {
            run_seq: run,
            ..Snapshot::empty()
        }
    }

    #[test]
    fn checksum_detects_tampering() {
        let mut snap = snapshot_at_run(1);
        snap.resources
            .insert("b".into(), record(ResourceKind::Bucket, "h1", &[]));
        snap.checksum = Some(snap.compute_checksum().unwrap());
        snap.verify_checksum().unwrap();

        snap.resources.get_mut("b").unwrap().config_hash = ConfigHash::new("h2");
        assert!(matches!(
            snap.verify_checksum(),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn apply_upserts_and_bumps_commit_seq() {
        let mut snap = snapshot_at_run(1);
        let mut batch = CommitBatch::new(1, 0);
        batch
            .upserts
            .push(("r".into(), record(ResourceKind::Role, "h", &[])));
        snap.apply(&batch).unwrap();
        assert_eq!(snap.commit_seq, 1);
        assert!(snap.resources.contains_key("r"));
    }

    #[test]
    fn apply_rejects_stale_run() {
        let mut snap = snapshot_at_run(2);
        let batch = CommitBatch::new(1, 0);
        assert!(matches!(
            snap.apply(&batch),
            Err(StoreError::StaleRun { batch: 1, current: 2 })
        ));
        assert_eq!(snap.commit_seq, 0);
    }

    #[test]
    fn apply_rejects_unapplied_dependency() {
        let mut snap = snapshot_at_run(1);
        let mut batch = CommitBatch::new(1, 1);
        batch
            .upserts
            .push(("f".into(), record(ResourceKind::ComputeFunction, "h", &["r"])));
        assert!(matches!(
            snap.apply(&batch),
            Err(StoreError::CommitRejected(_))
        ));
        assert!(snap.resources.is_empty(), "rejected batch must not be applied");
    }

    #[test]
    fn removal_scrubs_dependencies_and_bindings() {
        let mut snap = snapshot_at_run(1);
        snap.resources
            .insert("b".into(), record(ResourceKind::Bucket, "h", &[]));
        snap.resources
            .insert("f".into(), record(ResourceKind::ComputeFunction, "h", &["b"]));
        let grant = Binding::Grant(Grant::new("f", "b", Capability::Read));
        snap.bindings.insert(
            grant.key(),
            BindingRecord {
                hash: cirrus_schema::binding_hash(&grant).unwrap(),
                binding: grant,
                applied_run: 1,
                applied_at: String::new(),
            },
        );

        let mut batch = CommitBatch::new(1, 2);
        batch.removals.push("b".into());
        snap.apply(&batch).unwrap();

        assert!(!snap.resources.contains_key("b"));
        assert!(snap.resources["f"].depends_on.is_empty());
        assert!(snap.bindings.is_empty());
    }
}
