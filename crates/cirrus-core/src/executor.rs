use crate::lifecycle::{validate_transition, StepState};
use crate::plan::{Action, Plan, PlanStep, StepSubject};
use crate::retry::RetryPolicy;
use crate::settings::EngineSettings;
use crate::CoreError;
use cirrus_provider::{AdapterTable, ProviderAdapter, ProviderError};
use cirrus_schema::{
    canonical_json, references, substitute, Binding, Config, OutputRef, Outputs, ResourceId,
    ResourceKind,
};
use cirrus_store::{BindingRecord, CommitBatch, ResourceRecord, Snapshot, StateStore};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallyFailed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub key: String,
    pub level: usize,
    /// Effective action; a NoOp promoted at execution time reports `Update`.
    pub action: Action,
    pub state: StepState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub run_seq: u64,
    pub outcome: RunOutcome,
    pub steps: Vec<StepReport>,
}

impl ExecutionReport {
    pub fn step(&self, key: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.key == key)
    }

    fn in_state(&self, state: StepState) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(move |s| s.state == state)
    }

    /// Steps applied and committed in this run.
    pub fn committed(&self) -> impl Iterator<Item = &StepReport> {
        self.in_state(StepState::Applied)
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepReport> {
        self.in_state(StepState::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &StepReport> {
        self.in_state(StepState::Skipped)
    }

    /// Steps never reached because the run was aborted or halted.
    pub fn not_started(&self) -> impl Iterator<Item = &StepReport> {
        self.in_state(StepState::Pending)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }
}

type StopSignal = Arc<dyn Fn() -> bool + Send + Sync>;

/// Drives a [`Plan`] level by level through the provider adapters.
///
/// Steps of one level run concurrently, bounded by `max_in_flight`; levels
/// run strictly in order. After each level the applied subset is committed
/// to the state store before the next level starts, so a crash or abort
/// never loses a completed side effect's record.
pub struct Executor {
    adapters: AdapterTable,
    store: Arc<dyn StateStore>,
    max_in_flight: usize,
    op_timeout: Duration,
    retry: RetryPolicy,
    halt_on_failure: bool,
    should_stop: StopSignal,
}

/// Adapter call for one step, owning everything it needs.
enum StepOp {
    Create {
        id: ResourceId,
        kind: ResourceKind,
        config: Config,
    },
    Update {
        id: ResourceId,
        kind: ResourceKind,
        config: Config,
        previous: Outputs,
    },
    Delete {
        id: ResourceId,
        kind: ResourceKind,
        outputs: Outputs,
    },
    Bind {
        binding: Binding,
        subject: Outputs,
        target: Outputs,
    },
    Unbind {
        binding: Binding,
        owner: Outputs,
    },
}

impl StepOp {
    async fn invoke(&self, adapter: &dyn ProviderAdapter) -> Result<Option<Outputs>, ProviderError> {
        match self {
            StepOp::Create { id, kind, config } => adapter.create(id, *kind, config).await.map(Some),
            StepOp::Update {
                id,
                kind,
                config,
                previous,
            } => adapter.update(id, *kind, config, previous).await.map(Some),
            StepOp::Delete { id, kind, outputs } => {
                adapter.delete(id, *kind, outputs).await.map(|()| None)
            }
            StepOp::Bind {
                binding,
                subject,
                target,
            } => match binding {
                Binding::Grant(g) => adapter.bind_grant(g, subject, target).await,
                Binding::Route(r) => adapter.bind_route(r, target).await,
                Binding::Trigger(t) => adapter.bind_trigger(t, target).await,
            }
            .map(|()| None),
            StepOp::Unbind { binding, owner } => adapter.unbind(binding, owner).await.map(|()| None),
        }
    }
}

enum Prepared {
    Unchanged,
    Rejected(String),
    Dispatch {
        op: StepOp,
        adapter: Arc<dyn ProviderAdapter>,
        action: Action,
        fingerprint: Option<String>,
    },
}

struct Tracker {
    state: StepState,
    action: Action,
    attempts: u32,
    error: Option<String>,
}

/// Mutable bookkeeping of one run.
struct RunState<'a> {
    run_seq: u64,
    snapshot: &'a Snapshot,
    trackers: BTreeMap<String, Tracker>,
    outputs: BTreeMap<ResourceId, Outputs>,
    kinds: BTreeMap<ResourceId, ResourceKind>,
    failed_levels: BTreeSet<usize>,
}

impl<'a> RunState<'a> {
    fn new(run_seq: u64, plan: &Plan, snapshot: &'a Snapshot) -> Self {
        let mut kinds: BTreeMap<ResourceId, ResourceKind> = snapshot
            .resources
            .iter()
            .map(|(id, r)| (id.clone(), r.kind))
            .collect();
        for step in &plan.steps {
            if let Some((id, kind)) = step.resource() {
                kinds.insert(id.clone(), kind);
            }
        }
        Self {
            run_seq,
            snapshot,
            trackers: plan
                .steps
                .iter()
                .map(|s| {
                    (
                        s.key.clone(),
                        Tracker {
                            state: StepState::Pending,
                            action: s.action,
                            attempts: 0,
                            error: None,
                        },
                    )
                })
                .collect(),
            outputs: snapshot
                .resources
                .iter()
                .map(|(id, r)| (id.clone(), r.outputs.clone()))
                .collect(),
            kinds,
            failed_levels: BTreeSet::new(),
        }
    }

    fn transition(&mut self, key: &str, to: StepState) -> Result<(), CoreError> {
        let tracker = self
            .trackers
            .get_mut(key)
            .ok_or_else(|| CoreError::InvalidTransition {
                step: key.to_owned(),
                from: StepState::Pending,
                to,
            })?;
        validate_transition(key, tracker.state, to)?;
        tracker.state = to;
        Ok(())
    }

    fn state_of(&self, key: &str) -> Option<StepState> {
        self.trackers.get(key).map(|t| t.state)
    }

    /// First required step that failed or was skipped.
    fn blocker<'s>(&self, step: &'s PlanStep) -> Option<&'s str> {
        step.after
            .iter()
            .find(|k| {
                self.state_of(k)
                    .is_some_and(|s| s.is_terminal() && !s.satisfies_dependents())
            })
            .map(String::as_str)
    }

    fn skip(&mut self, step: &PlanStep, blocker: &str) -> Result<(), CoreError> {
        self.transition(&step.key, StepState::Skipped)?;
        if let Some(t) = self.trackers.get_mut(&step.key) {
            t.error = Some(format!("dependency '{blocker}' did not apply"));
        }
        debug!("skipping {}: dependency '{blocker}' did not apply", step.key);
        Ok(())
    }

    fn fail(&mut self, step: &PlanStep, error: String, attempts: u32) -> Result<(), CoreError> {
        if self.state_of(&step.key) == Some(StepState::Pending) {
            self.transition(&step.key, StepState::Applying)?;
        }
        self.transition(&step.key, StepState::Failed)?;
        warn!("{} failed after {attempts} attempt(s): {error}", step);
        if let Some(t) = self.trackers.get_mut(&step.key) {
            t.attempts = attempts;
            t.error = Some(error);
        }
        self.failed_levels.insert(step.level);
        Ok(())
    }

    fn outputs_of(&self, id: &ResourceId) -> Outputs {
        self.outputs.get(id).cloned().unwrap_or_default()
    }

    fn lookup(&self, r: &OutputRef) -> Option<serde_json::Value> {
        self.outputs
            .get(&r.resource)
            .and_then(|o| o.get(&r.output))
            .cloned()
    }

    /// Endpoint applied (not merely unchanged) earlier in this run.
    fn changed_this_run(&self, id: &ResourceId) -> bool {
        self.trackers.get(id.as_str()).is_some_and(|t| {
            t.state == StepState::Applied && matches!(t.action, Action::Create | Action::Update)
        })
    }

    fn report(self, plan: &Plan, outcome: RunOutcome) -> ExecutionReport {
        let mut trackers = self.trackers;
        let steps = plan
            .steps
            .iter()
            .filter_map(|s| {
                trackers.remove(&s.key).map(|t| StepReport {
                    key: s.key.clone(),
                    level: s.level,
                    action: t.action,
                    state: t.state,
                    attempts: t.attempts,
                    error: t.error,
                })
            })
            .collect();
        ExecutionReport {
            run_seq: self.run_seq,
            outcome,
            steps,
        }
    }
}

/// blake3 over the referenced output values, `None` without references.
fn input_fingerprint(
    refs: &BTreeSet<OutputRef>,
    run: &RunState<'_>,
) -> Result<Option<String>, CoreError> {
    if refs.is_empty() {
        return Ok(None);
    }
    let inputs: BTreeMap<String, serde_json::Value> = refs
        .iter()
        .map(|r| {
            (
                format!("{}.{}", r.resource, r.output),
                run.lookup(r).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    let json = canonical_json(&inputs)?;
    Ok(Some(blake3::hash(json.as_bytes()).to_hex().to_string()))
}

impl Executor {
    pub fn new(adapters: AdapterTable, store: Arc<dyn StateStore>) -> Self {
        let defaults = EngineSettings::default();
        Self {
            adapters,
            store,
            max_in_flight: defaults.max_in_flight,
            op_timeout: defaults.op_timeout(),
            retry: defaults.retry_policy(),
            halt_on_failure: defaults.halt_on_failure,
            should_stop: Arc::new(|| false),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: &EngineSettings) -> Self {
        self.max_in_flight = settings.max_in_flight.max(1);
        self.op_timeout = settings.op_timeout();
        self.retry = settings.retry_policy();
        self.halt_on_failure = settings.halt_on_failure;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Checked before each level; returning `true` aborts the run.
    #[must_use]
    pub fn with_stop_signal<F>(mut self, should_stop: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_stop = Arc::new(should_stop);
        self
    }

    pub async fn execute(&self, plan: &Plan) -> Result<ExecutionReport, CoreError> {
        let run_seq = self.store.begin_run()?;
        let snapshot = self.store.load()?;
        let mut run = RunState::new(run_seq, plan, &snapshot);
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight.max(1)));
        let levels = plan.level_count();
        info!(
            "run {run_seq}: {} step(s) in {levels} level(s)",
            plan.steps.len()
        );

        let mut aborted = false;
        for level in 0..levels {
            if (self.should_stop)() {
                warn!("run {run_seq}: abort requested before level {level}");
                aborted = true;
                break;
            }

            let (bindings, resources): (Vec<&PlanStep>, Vec<&PlanStep>) =
                plan.level(level).partition(|s| s.is_binding());
            let dispatched: Vec<String> = resources
                .iter()
                .chain(bindings.iter())
                .filter(|s| s.action != Action::NoOp)
                .map(|s| s.key.clone())
                .collect();
            if !dispatched.is_empty() {
                self.store.begin_level(run_seq, level, &dispatched)?;
            }

            let mut batch = CommitBatch::new(run_seq, level);
            self.run_phase(&resources, &mut run, &semaphore, &mut batch)
                .await?;
            self.run_phase(&bindings, &mut run, &semaphore, &mut batch)
                .await?;
            self.store.commit(&batch)?;
            debug!(
                "run {run_seq}: level {level} committed ({} change(s))",
                batch.len()
            );

            if self.halt_on_failure && run.failed_levels.contains(&level) {
                warn!("run {run_seq}: halting after failures in level {level}");
                break;
            }
        }

        let incomplete = run
            .trackers
            .values()
            .any(|t| !t.state.satisfies_dependents());
        let outcome = if aborted {
            RunOutcome::Aborted
        } else if incomplete {
            RunOutcome::PartiallyFailed
        } else {
            RunOutcome::Succeeded
        };
        info!("run {run_seq}: {outcome:?}");
        Ok(run.report(plan, outcome))
    }

    async fn run_phase(
        &self,
        steps: &[&PlanStep],
        run: &mut RunState<'_>,
        semaphore: &Arc<Semaphore>,
        batch: &mut CommitBatch,
    ) -> Result<(), CoreError> {
        let mut tasks = JoinSet::new();
        let mut in_flight: BTreeMap<String, (&PlanStep, Option<String>)> = BTreeMap::new();

        for &step in steps {
            if let Some(blocker) = run.blocker(step) {
                run.skip(step, blocker)?;
                continue;
            }
            match self.prepare(step, run)? {
                Prepared::Unchanged => {
                    run.transition(&step.key, StepState::Unchanged)?;
                    refresh_dependencies(step, run, batch);
                }
                Prepared::Rejected(error) => run.fail(step, error, 0)?,
                Prepared::Dispatch {
                    op,
                    adapter,
                    action,
                    fingerprint,
                } => {
                    if let Some(t) = run.trackers.get_mut(&step.key) {
                        t.action = action;
                    }
                    run.transition(&step.key, StepState::Applying)?;
                    debug!("dispatching {action} {}", step.subject);
                    in_flight.insert(step.key.clone(), (step, fingerprint));

                    let key = step.key.clone();
                    let semaphore = Arc::clone(semaphore);
                    let retry = self.retry;
                    let timeout = self.op_timeout;
                    tasks.spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            let closed = ProviderError::Permanent("executor shut down".to_owned());
                            return (key, Err(closed), 0);
                        };
                        let (result, attempts) =
                            retry.run(timeout, || op.invoke(adapter.as_ref())).await;
                        (key, result, attempts)
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, result, attempts)) => {
                    if let Some((step, fingerprint)) = in_flight.remove(&key) {
                        self.complete(step, fingerprint, result, attempts, run, batch)?;
                    }
                }
                Err(e) => warn!("step task did not complete: {e}"),
            }
        }
        for (_, (step, _)) in in_flight {
            run.fail(step, "step task did not complete".to_owned(), 0)?;
        }
        Ok(())
    }

    fn adapter_for(&self, kind: ResourceKind) -> Result<Arc<dyn ProviderAdapter>, String> {
        self.adapters
            .get(kind)
            .map(Arc::clone)
            .map_err(|e| e.to_string())
    }

    fn prepare(&self, step: &PlanStep, run: &RunState<'_>) -> Result<Prepared, CoreError> {
        match &step.subject {
            StepSubject::Resource { id, kind } => self.prepare_resource(step, id, *kind, run),
            StepSubject::Binding(binding) => Ok(self.prepare_binding(step, binding, run)),
        }
    }

    fn prepare_resource(
        &self,
        step: &PlanStep,
        id: &ResourceId,
        kind: ResourceKind,
        run: &RunState<'_>,
    ) -> Result<Prepared, CoreError> {
        let adapter = match self.adapter_for(kind) {
            Ok(adapter) => adapter,
            Err(e) if step.action != Action::NoOp => return Ok(Prepared::Rejected(e)),
            Err(_) => return Ok(Prepared::Unchanged),
        };

        if step.action == Action::Delete {
            return Ok(Prepared::Dispatch {
                op: StepOp::Delete {
                    id: id.clone(),
                    kind,
                    outputs: run.outputs_of(id),
                },
                adapter,
                action: Action::Delete,
                fingerprint: None,
            });
        }

        let refs = match references(&step.config) {
            Ok(refs) => refs,
            Err(e) => return Ok(Prepared::Rejected(e.to_string())),
        };
        let fingerprint = input_fingerprint(&refs, run)?;
        let recorded = run.snapshot.resources.get(id);

        let action = match step.action {
            Action::NoOp => {
                let inputs_changed =
                    recorded.is_some_and(|r| r.input_fingerprint != fingerprint);
                if !inputs_changed {
                    return Ok(Prepared::Unchanged);
                }
                debug!("'{id}': referenced outputs changed, promoting to update");
                Action::Update
            }
            other => other,
        };

        let config = match substitute(&step.config, |r| run.lookup(r)) {
            Ok(config) => config,
            Err(e) => return Ok(Prepared::Rejected(e.to_string())),
        };
        let op = match (action, recorded) {
            (Action::Update, Some(record)) => StepOp::Update {
                id: id.clone(),
                kind,
                config,
                previous: record.outputs.clone(),
            },
            _ => StepOp::Create {
                id: id.clone(),
                kind,
                config,
            },
        };
        Ok(Prepared::Dispatch {
            op,
            adapter,
            action,
            fingerprint,
        })
    }

    fn prepare_binding(&self, step: &PlanStep, binding: &Binding, run: &RunState<'_>) -> Prepared {
        let owner = binding.owner();
        let Some(kind) = run.kinds.get(owner).copied() else {
            return Prepared::Rejected(format!("owner '{owner}' of {binding} is unknown"));
        };

        let action = match step.action {
            Action::NoOp => {
                let rebind = binding
                    .endpoints()
                    .into_iter()
                    .any(|e| run.changed_this_run(e));
                if !rebind {
                    return Prepared::Unchanged;
                }
                Action::Update
            }
            other => other,
        };
        let adapter = match self.adapter_for(kind) {
            Ok(adapter) => adapter,
            Err(e) => return Prepared::Rejected(e),
        };

        let op = if action == Action::Delete {
            StepOp::Unbind {
                binding: binding.clone(),
                owner: run.outputs_of(owner),
            }
        } else {
            let (subject, target) = match binding {
                Binding::Grant(g) => (run.outputs_of(&g.subject), run.outputs_of(&g.target)),
                Binding::Route(r) => (Outputs::new(), run.outputs_of(&r.target)),
                Binding::Trigger(t) => (Outputs::new(), run.outputs_of(&t.target)),
            };
            StepOp::Bind {
                binding: binding.clone(),
                subject,
                target,
            }
        };
        Prepared::Dispatch {
            op,
            adapter,
            action,
            fingerprint: None,
        }
    }

    fn complete(
        &self,
        step: &PlanStep,
        fingerprint: Option<String>,
        result: Result<Option<Outputs>, ProviderError>,
        attempts: u32,
        run: &mut RunState<'_>,
        batch: &mut CommitBatch,
    ) -> Result<(), CoreError> {
        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => return run.fail(step, e.message().to_owned(), attempts),
        };
        run.transition(&step.key, StepState::Applied)?;
        let action = match run.trackers.get_mut(&step.key) {
            Some(t) => {
                t.attempts = attempts;
                t.action
            }
            None => step.action,
        };
        let now = chrono::Utc::now().to_rfc3339();

        match (&step.subject, action) {
            (StepSubject::Resource { id, .. }, Action::Delete) => {
                run.outputs.remove(id);
                batch.removals.push(id.clone());
            }
            (StepSubject::Resource { id, kind }, _) => {
                let outputs = outputs.unwrap_or_default();
                run.outputs.insert(id.clone(), outputs.clone());
                if let Some(hash) = step.hash.clone() {
                    batch.upserts.push((
                        id.clone(),
                        ResourceRecord {
                            kind: *kind,
                            config_hash: hash,
                            outputs,
                            depends_on: step.depends_on.clone(),
                            input_fingerprint: fingerprint,
                            applied_run: run.run_seq,
                            applied_at: now,
                        },
                    ));
                }
            }
            (StepSubject::Binding(_), Action::Delete) => {
                batch.binding_removals.push(step.key.clone());
            }
            (StepSubject::Binding(binding), _) => {
                let hash = match step.hash.clone() {
                    Some(hash) => hash,
                    None => return Ok(()),
                };
                batch.binding_upserts.push((
                    step.key.clone(),
                    BindingRecord {
                        binding: binding.clone(),
                        hash,
                        applied_run: run.run_seq,
                        applied_at: now,
                    },
                ));
            }
        }
        debug!("applied {action} {} after {attempts} attempt(s)", step.subject);
        Ok(())
    }
}

/// An unchanged resource whose effective dependencies changed (for example
/// a new grant edge) gets its record refreshed without an adapter call.
fn refresh_dependencies(step: &PlanStep, run: &RunState<'_>, batch: &mut CommitBatch) {
    let Some((id, _)) = step.resource() else {
        return;
    };
    if let Some(record) = run.snapshot.resources.get(id) {
        if record.depends_on != step.depends_on {
            let mut refreshed = record.clone();
            refreshed.depends_on = step.depends_on.clone();
            batch.upserts.push((id.clone(), refreshed));
        }
    }
}
