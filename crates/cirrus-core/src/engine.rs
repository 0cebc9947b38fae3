use crate::concurrency::{LockHolder, StateLock};
use crate::executor::{ExecutionReport, Executor};
use crate::graph::ResourceGraph;
use crate::plan::{self, Plan};
use crate::settings::EngineSettings;
use crate::CoreError;
use cirrus_provider::AdapterTable;
use cirrus_schema::{parse_spec_file, DesiredSpec};
use cirrus_store::{
    verify_state, FileStateStore, IntegrityReport, JournalEntry, Snapshot, StateLayout,
    StateStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

type StopSignal = Arc<dyn Fn() -> bool + Send + Sync>;

/// Outcome of an apply or destroy run.
pub struct ApplyResult {
    pub plan: Plan,
    pub report: ExecutionReport,
    /// Levels a previous run left in the journal.
    pub recovered: Vec<JournalEntry>,
}

/// Entry point for planning and applying desired specs against one state
/// directory.
pub struct Engine {
    layout: Option<StateLayout>,
    store: Arc<dyn StateStore>,
    adapters: AdapterTable,
    settings: EngineSettings,
    should_stop: StopSignal,
}

impl Engine {
    /// Engine over the file-backed state under `state_root`.
    pub fn new(
        state_root: impl Into<PathBuf>,
        adapters: AdapterTable,
        settings: EngineSettings,
    ) -> Self {
        let layout = StateLayout::new(state_root.into());
        let store = Arc::new(FileStateStore::new(layout.clone()));
        Self {
            layout: Some(layout),
            store,
            adapters,
            settings,
            should_stop: Arc::new(|| false),
        }
    }

    /// Engine over an arbitrary store, without a state directory lock.
    pub fn with_store(
        store: Arc<dyn StateStore>,
        adapters: AdapterTable,
        settings: EngineSettings,
    ) -> Self {
        Self {
            layout: None,
            store,
            adapters,
            settings,
            should_stop: Arc::new(|| false),
        }
    }

    #[must_use]
    pub fn with_stop_signal<F>(mut self, should_stop: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_stop = Arc::new(should_stop);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn load_spec(path: &Path) -> Result<DesiredSpec, CoreError> {
        let manifest = parse_spec_file(path)?;
        Ok(manifest.normalize()?)
    }

    /// Dry run: validate, resolve and diff against the committed snapshot.
    pub fn plan(&self, spec: &DesiredSpec) -> Result<Plan, CoreError> {
        let graph = ResourceGraph::build(spec)?;
        let snapshot = self.store.load()?;
        plan::plan(&graph, &snapshot)
    }

    pub fn plan_destroy(&self) -> Result<Plan, CoreError> {
        let snapshot = self.store.load()?;
        plan::plan_destroy(&snapshot)
    }

    pub async fn apply(&self, spec: &DesiredSpec) -> Result<ApplyResult, CoreError> {
        let graph = ResourceGraph::build(spec)?;
        let _lock = self.lock("apply")?;
        let recovered = self.recover()?;
        let snapshot = self.store.load()?;
        let plan = plan::plan(&graph, &snapshot)?;
        info!("applying plan: {}", plan.summary());
        let report = self.executor().execute(&plan).await?;
        Ok(ApplyResult {
            plan,
            report,
            recovered,
        })
    }

    pub async fn destroy(&self) -> Result<ApplyResult, CoreError> {
        let _lock = self.lock("destroy")?;
        let recovered = self.recover()?;
        let plan = self.plan_destroy()?;
        info!("destroying: {}", plan.summary());
        let report = self.executor().execute(&plan).await?;
        Ok(ApplyResult {
            plan,
            report,
            recovered,
        })
    }

    pub fn snapshot(&self) -> Result<Snapshot, CoreError> {
        Ok(self.store.load()?)
    }

    pub fn verify_state(&self) -> Result<IntegrityReport, CoreError> {
        match &self.layout {
            Some(layout) => Ok(verify_state(layout)?),
            None => Ok(IntegrityReport {
                checked: 0,
                passed: 0,
                failed: Vec::new(),
                interrupted_levels: 0,
            }),
        }
    }

    fn executor(&self) -> Executor {
        let stop = Arc::clone(&self.should_stop);
        Executor::new(self.adapters.clone(), Arc::clone(&self.store))
            .with_settings(&self.settings)
            .with_stop_signal(move || stop())
    }

    fn lock(&self, operation: &str) -> Result<Option<StateLock>, CoreError> {
        let Some(layout) = &self.layout else {
            return Ok(None);
        };
        layout.initialize()?;
        StateLock::acquire(&layout.lock_file(), &LockHolder::current(operation)).map(Some)
    }

    fn recover(&self) -> Result<Vec<JournalEntry>, CoreError> {
        let recovered = self.store.recover()?;
        for entry in &recovered {
            warn!(
                "run {} was interrupted in level {}; re-planning {} step(s)",
                entry.run_seq,
                entry.level,
                entry.steps.len()
            );
        }
        Ok(recovered)
    }
}
