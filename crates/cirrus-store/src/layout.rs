use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current state format version. Incremented on incompatible layout changes.
pub const STATE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a Cirrus state directory.
///
/// ```text
/// <root>/state/snapshot.json
/// <root>/state/journal/<op_id>.json
/// <root>/state/version
/// <root>/state/.lock
/// ```
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateVersion {
    format_version: u32,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    #[inline]
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir().join("snapshot.json")
    }

    #[inline]
    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir().join("journal")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(".lock")
    }

    /// Directory handed to the local provider for materialised resources.
    #[inline]
    pub fn local_provider_dir(&self) -> PathBuf {
        self.root.join("local")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.journal_dir())?;

        let version_path = self.state_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StateVersion {
                format_version: STATE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&self.state_dir(), &version_path, content.as_bytes())?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.state_dir().join(VERSION_FILE))?;
        let ver: StateVersion = serde_json::from_str(&content)?;
        if ver.format_version != STATE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
