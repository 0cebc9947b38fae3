use crate::adapter::ProviderAdapter;
use crate::ProviderError;
use async_trait::async_trait;
use cirrus_schema::{Binding, Config, Grant, Outputs, ResourceId, ResourceKind, Route, Trigger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    BindGrant,
    BindRoute,
    BindTrigger,
    Unbind,
}

/// One adapter invocation, failed or not. `key` is the resource id or the
/// binding key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: Operation,
    pub key: String,
}

#[derive(Debug, Clone)]
enum Failure {
    Transient { remaining: u32 },
    Permanent,
}

#[derive(Default)]
struct MockState {
    resources: BTreeMap<ResourceId, (ResourceKind, Config, Outputs)>,
    bindings: BTreeSet<String>,
    calls: Vec<MockCall>,
    failures: BTreeMap<String, Failure>,
    delays: BTreeMap<String, Duration>,
}

/// In-memory provider with deterministic outputs.
///
/// Failures and latency are scripted per key (resource id or binding key),
/// and every call is logged so tests can assert on what the engine issued.
#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls for `key` with a transient error.
    pub fn fail_transient(&self, key: &str, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state
                .failures
                .insert(key.to_owned(), Failure::Transient { remaining: times });
        }
    }

    /// Fail every call for `key` with a permanent error.
    pub fn fail_permanent(&self, key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(key.to_owned(), Failure::Permanent);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.clear();
        }
    }

    /// Delay every call for `key` by `delay` before it completes.
    pub fn delay(&self, key: &str, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.delays.insert(key.to_owned(), delay);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn calls_for(&self, key: &str) -> Vec<Operation> {
        self.calls()
            .into_iter()
            .filter(|c| c.key == key)
            .map(|c| c.op)
            .collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.resources.contains_key(id))
            .unwrap_or(false)
    }

    /// The config most recently applied to `id`, after substitution.
    pub fn config_of(&self, id: &str) -> Option<Config> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.resources.get(id).map(|(_, c, _)| c.clone()))
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.bindings.contains(key))
            .unwrap_or(false)
    }

    /// Highest number of calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, ProviderError> {
        self.state
            .lock()
            .map_err(|e| ProviderError::Permanent(format!("mock state poisoned: {e}")))
    }

    /// Log the call, apply scripted latency and failures.
    async fn enter(&self, op: Operation, key: &str) -> Result<(), ProviderError> {
        let delay = {
            let mut state = self.lock()?;
            state.calls.push(MockCall {
                op,
                key: key.to_owned(),
            });
            state.delays.get(key).copied()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock()?;
        match state.failures.get_mut(key) {
            Some(Failure::Permanent) => Err(ProviderError::Permanent(format!(
                "scripted failure for '{key}'"
            ))),
            Some(Failure::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::Transient(format!(
                    "scripted throttling for '{key}'"
                )))
            }
            _ => Ok(()),
        }
    }

    fn outputs(id: &ResourceId, kind: ResourceKind, revision: u64) -> Outputs {
        let mut outputs = Outputs::new();
        outputs.insert(
            "arn".to_owned(),
            serde_json::Value::String(format!("arn:mock:{kind}:{id}")),
        );
        outputs.insert("revision".to_owned(), serde_json::json!(revision));
        if kind == ResourceKind::ApiGateway {
            outputs.insert(
                "endpoint".to_owned(),
                serde_json::Value::String(format!("https://{id}.mock.invalid")),
            );
        }
        outputs
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
    ) -> Result<Outputs, ProviderError> {
        self.enter(Operation::Create, id).await?;
        let mut state = self.lock()?;
        let outputs = match state.resources.get(id) {
            Some((_, _, existing)) => existing.clone(),
            None => Self::outputs(id, kind, 1),
        };
        state
            .resources
            .insert(id.clone(), (kind, config.clone(), outputs.clone()));
        Ok(outputs)
    }

    async fn update(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        config: &Config,
        previous: &Outputs,
    ) -> Result<Outputs, ProviderError> {
        self.enter(Operation::Update, id).await?;
        let revision = previous
            .get("revision")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
            + 1;
        let outputs = Self::outputs(id, kind, revision);
        self.lock()?
            .resources
            .insert(id.clone(), (kind, config.clone(), outputs.clone()));
        Ok(outputs)
    }

    async fn delete(
        &self,
        id: &ResourceId,
        _kind: ResourceKind,
        _outputs: &Outputs,
    ) -> Result<(), ProviderError> {
        self.enter(Operation::Delete, id).await?;
        self.lock()?.resources.remove(id);
        Ok(())
    }

    async fn bind_grant(
        &self,
        grant: &Grant,
        _subject: &Outputs,
        _target: &Outputs,
    ) -> Result<(), ProviderError> {
        let key = Binding::Grant(grant.clone()).key();
        self.enter(Operation::BindGrant, &key).await?;
        self.lock()?.bindings.insert(key);
        Ok(())
    }

    async fn bind_route(&self, route: &Route, _target: &Outputs) -> Result<(), ProviderError> {
        let key = Binding::Route(route.clone()).key();
        self.enter(Operation::BindRoute, &key).await?;
        self.lock()?.bindings.insert(key);
        Ok(())
    }

    async fn bind_trigger(
        &self,
        trigger: &Trigger,
        _target: &Outputs,
    ) -> Result<(), ProviderError> {
        let key = Binding::Trigger(trigger.clone()).key();
        self.enter(Operation::BindTrigger, &key).await?;
        self.lock()?.bindings.insert(key);
        Ok(())
    }

    async fn unbind(&self, binding: &Binding, _owner: &Outputs) -> Result<(), ProviderError> {
        let key = binding.key();
        self.enter(Operation::Unbind, &key).await?;
        self.lock()?.bindings.remove(&key);
        Ok(())
    }
}
