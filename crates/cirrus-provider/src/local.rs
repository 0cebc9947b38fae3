use crate::adapter::ProviderAdapter;
use crate::ProviderError;
use async_trait::async_trait;
use cirrus_schema::{Binding, Config, Grant, Outputs, ResourceId, ResourceKind, Route, Trigger};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Materialises resources and bindings as JSON documents under a directory.
///
/// ```text
/// <root>/resources/<kind>/<id>.json
/// <root>/bindings/<blake3(key)>.json
/// ```
pub struct LocalAdapter {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceDocument {
    id: ResourceId,
    kind: ResourceKind,
    config: Config,
    outputs: Outputs,
}

#[derive(Debug, Serialize, Deserialize)]
struct BindingDocument {
    key: String,
    binding: Binding,
    /// Seconds between invocations, for rate triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval_secs: Option<u64>,
}

impl LocalAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resource_path(&self, id: &str, kind: ResourceKind) -> Result<PathBuf, ProviderError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !valid {
            return Err(ProviderError::Permanent(format!(
                "resource id '{id}' cannot be used as a local file name"
            )));
        }
        Ok(self
            .root
            .join("resources")
            .join(kind.as_str())
            .join(format!("{id}.json")))
    }

    pub fn binding_path(&self, key: &str) -> PathBuf {
        let name = blake3::hash(key.as_bytes()).to_hex();
        self.root.join("bindings").join(format!("{}.json", &name.as_str()[..32]))
    }

    async fn write(&self, path: PathBuf, content: Vec<u8>) -> Result<(), ProviderError> {
        blocking(move || write_atomic(&path, &content)).await
    }

    async fn remove(&self, path: PathBuf) -> Result<(), ProviderError> {
        blocking(move || match fs::remove_file(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .await
    }

    async fn put_resource(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
    ) -> Result<Outputs, ProviderError> {
        let path = self.resource_path(id, kind)?;
        let mut outputs = Outputs::new();
        outputs.insert(
            "arn".to_owned(),
            serde_json::Value::String(format!("local:{kind}:{id}")),
        );
        outputs.insert(
            "path".to_owned(),
            serde_json::Value::String(path.display().to_string()),
        );
        let doc = ResourceDocument {
            id: id.clone(),
            kind,
            config: config.clone(),
            outputs: outputs.clone(),
        };
        let content = serde_json::to_vec_pretty(&doc).map_err(permanent)?;
        self.write(path, content).await?;
        debug!("local: wrote {kind} '{id}'");
        Ok(outputs)
    }

    async fn put_binding(&self, binding: Binding) -> Result<(), ProviderError> {
        let key = binding.key();
        let path = self.binding_path(&key);
        let interval_secs = match &binding {
            Binding::Trigger(t) => t.schedule.interval().map(|d| d.as_secs()),
            _ => None,
        };
        let doc = BindingDocument {
            key,
            binding,
            interval_secs,
        };
        let content = serde_json::to_vec_pretty(&doc).map_err(permanent)?;
        self.write(path, content).await?;
        debug!("local: bound {}", doc.key);
        Ok(())
    }
}

fn permanent(e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Permanent(e.to_string())
}

fn io_error(e: std::io::Error) -> ProviderError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            ProviderError::Transient(e.to_string())
        }
        _ => ProviderError::Permanent(e.to_string()),
    }
}

async fn blocking<F>(f: F) -> Result<(), ProviderError>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Transient(format!("local adapter task failed: {e}")))?
        .map_err(io_error)
}

fn write_atomic(dest: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| std::io::Error::other("destination has no parent directory"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ProviderAdapter for LocalAdapter {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
    ) -> Result<Outputs, ProviderError> {
        self.put_resource(id, kind, config).await
    }

    async fn update(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
        _previous: &Outputs,
    ) -> Result<Outputs, ProviderError> {
        self.put_resource(id, kind, config).await
    }

    async fn delete(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        _outputs: &Outputs,
    ) -> Result<(), ProviderError> {
        let path = self.resource_path(id, kind)?;
        self.remove(path).await?;
        debug!("local: removed {kind} '{id}'");
        Ok(())
    }

    async fn bind_grant(
        &self,
        grant: &Grant,
        _subject: &Outputs,
        _target: &Outputs,
    ) -> Result<(), ProviderError> {
        self.put_binding(Binding::Grant(grant.clone())).await
    }

    async fn bind_route(&self, route: &Route, _target: &Outputs) -> Result<(), ProviderError> {
        self.put_binding(Binding::Route(route.clone())).await
    }

    async fn bind_trigger(
        &self,
        trigger: &Trigger,
        _target: &Outputs,
    ) -> Result<(), ProviderError> {
        self.put_binding(Binding::Trigger(trigger.clone())).await
    }

    async fn unbind(&self, binding: &Binding, _owner: &Outputs) -> Result<(), ProviderError> {
        let path = self.binding_path(&binding.key());
        self.remove(path).await
    }
}
