use crate::retry::RetryPolicy;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Executor tuning, read from `~/.config/cirrus/engine.toml` when present.
///
/// ```toml
/// max_in_flight = 8
/// op_timeout_secs = 300
/// halt_on_failure = false
///
/// [retry]
/// max_attempts = 3
/// base_delay_ms = 200
/// max_delay_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Upper bound on concurrent adapter operations within a level.
    pub max_in_flight: usize,
    pub op_timeout_secs: u64,
    pub retry: RetrySettings,
    /// Stop after the first level with a failed step instead of continuing
    /// with work that does not depend on the failure.
    pub halt_on_failure: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            op_timeout_secs: 300,
            retry: RetrySettings::default(),
            halt_on_failure: false,
        }
    }
}

impl EngineSettings {
    /// Load from `path`, or from the default location if `path` is `None`.
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let settings = match path {
            Some(path) => Self::load_file(path)?,
            None => match default_settings_path() {
                Some(path) if path.exists() => Self::load_file(&path)?,
                _ => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Settings(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Settings(format!("invalid {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_in_flight == 0 {
            return Err(CoreError::Settings("max_in_flight must be at least 1".to_owned()));
        }
        if self.op_timeout_secs == 0 {
            return Err(CoreError::Settings("op_timeout_secs must be at least 1".to_owned()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Settings(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CoreError::Settings(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

fn default_settings_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/cirrus/engine.toml"))
}
