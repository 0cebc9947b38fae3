use crate::ProviderError;
use async_trait::async_trait;
use cirrus_schema::{Binding, Config, Grant, Outputs, ResourceId, ResourceKind, Route, Trigger};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Capability set a provider exposes for one or more resource kinds.
///
/// Every operation must be idempotent: the engine re-issues a create for a
/// resource whose previous outcome is unknown, and re-binds relationships on
/// every retry.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn create(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
    ) -> Result<Outputs, ProviderError>;

    async fn update(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
        previous: &Outputs,
    ) -> Result<Outputs, ProviderError>;

    async fn delete(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        outputs: &Outputs,
    ) -> Result<(), ProviderError>;

    async fn bind_grant(
        &self,
        grant: &Grant,
        subject: &Outputs,
        target: &Outputs,
    ) -> Result<(), ProviderError>;

    async fn bind_route(&self, route: &Route, target: &Outputs) -> Result<(), ProviderError>;

    async fn bind_trigger(&self, trigger: &Trigger, target: &Outputs)
        -> Result<(), ProviderError>;

    /// Remove a relationship that is no longer declared. `owner` holds the
    /// outputs of the resource whose adapter applied it.
    async fn unbind(&self, _binding: &Binding, _owner: &Outputs) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Adapter per resource kind.
#[derive(Clone, Default)]
pub struct AdapterTable {
    adapters: BTreeMap<ResourceKind, Arc<dyn ProviderAdapter>>,
}

impl AdapterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// One adapter serving every kind.
    pub fn uniform(adapter: Arc<dyn ProviderAdapter>) -> Self {
        let mut table = Self::new();
        for kind in ResourceKind::ALL {
            table.register(kind, Arc::clone(&adapter));
        }
        table
    }

    pub fn register(&mut self, kind: ResourceKind, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(kind, adapter);
    }

    #[must_use]
    pub fn with(mut self, kind: ResourceKind, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(kind, adapter);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Result<&Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&kind)
            .ok_or_else(|| ProviderError::Permanent(format!("no adapter registered for {kind}")))
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}

/// Build the adapter table for a named provider. `dir` is where
/// file-backed providers keep their documents.
pub fn select_adapters(name: &str, dir: &Path) -> Result<AdapterTable, ProviderError> {
    match name {
        "local" => Ok(AdapterTable::uniform(Arc::new(crate::local::LocalAdapter::new(dir)))),
        "mock" => Ok(AdapterTable::uniform(Arc::new(crate::mock::MockAdapter::new()))),
        other => Err(ProviderError::Permanent(format!(
            "unknown provider '{other}' (expected 'local' or 'mock')"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_providers() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["local", "mock"] {
            let table = select_adapters(name, dir.path()).unwrap();
            for kind in ResourceKind::ALL {
                assert_eq!(table.get(kind).unwrap().name(), name);
            }
        }
    }

    #[test]
    fn select_invalid_provider_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(select_adapters("nonexistent", dir.path()).is_err());
    }

    #[test]
    fn missing_kind_is_permanent_error() {
        let table = AdapterTable::new().with(
            ResourceKind::Bucket,
            Arc::new(crate::mock::MockAdapter::new()),
        );
        assert!(table.contains(ResourceKind::Bucket));
        let err = table.get(ResourceKind::Role).err().unwrap();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("role"));
    }
}
