use crate::graph::{ResourceGraph, ValidationError};
use crate::permissions::resolve_grants;
use crate::CoreError;
use cirrus_schema::{
    binding_hash, config_hash, Binding, Config, ConfigHash, ResourceId, ResourceKind,
};
use cirrus_store::Snapshot;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    #[serde(rename = "noop")]
    NoOp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::NoOp => write!(f, "no-op"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSubject {
    Resource { id: ResourceId, kind: ResourceKind },
    Binding(Binding),
}

impl fmt::Display for StepSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepSubject::Resource { id, kind } => write!(f, "{kind} '{id}'"),
            StepSubject::Binding(binding) => write!(f, "{binding}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// Resource id, or binding key for binding steps.
    pub key: String,
    pub subject: StepSubject,
    pub action: Action,
    pub level: usize,
    /// Keys of the steps that must have succeeded (or been unchanged) first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Desired hash; absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<ConfigHash>,
    /// Desired config, before output substitution.
    #[serde(skip)]
    pub config: Config,
    /// Effective dependencies recorded with the resource once applied.
    #[serde(skip)]
    pub depends_on: BTreeSet<ResourceId>,
}

impl PlanStep {
    pub fn resource(&self) -> Option<(&ResourceId, ResourceKind)> {
        match &self.subject {
            StepSubject::Resource { id, kind } => Some((id, *kind)),
            StepSubject::Binding(_) => None,
        }
    }

    pub fn binding(&self) -> Option<&Binding> {
        match &self.subject {
            StepSubject::Binding(b) => Some(b),
            StepSubject::Resource { .. } => None,
        }
    }

    pub fn is_binding(&self) -> bool {
        self.binding().is_some()
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.subject)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

/// Level-ordered steps. Within a level resource steps precede binding
/// steps; each group is in ascending key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

#[derive(Serialize)]
struct PlanDocument<'a> {
    summary: PlanSummary,
    levels: usize,
    steps: &'a [PlanStep],
}

impl Plan {
    pub fn level_count(&self) -> usize {
        self.steps.iter().map(|s| s.level + 1).max().unwrap_or(0)
    }

    pub fn level(&self, level: usize) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(move |s| s.level == level)
    }

    pub fn get(&self, key: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for step in &self.steps {
            match step.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Delete => summary.delete += 1,
                Action::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.action != Action::NoOp)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&PlanDocument {
            summary: self.summary(),
            levels: self.level_count(),
            steps: &self.steps,
        })
    }
}

/// Desired relationships: resolved grants, routes and triggers, keyed by
/// binding key.
pub fn desired_bindings(graph: &ResourceGraph) -> BTreeMap<String, Binding> {
    let grants = resolve_grants(graph.grants()).into_iter().map(Binding::Grant);
    let routes = graph.routes().iter().cloned().map(Binding::Route);
    let triggers = graph.triggers().iter().cloned().map(Binding::Trigger);
    grants
        .chain(routes)
        .chain(triggers)
        .map(|b| (b.key(), b))
        .collect()
}

/// Diff the desired graph against the last committed snapshot.
///
/// A resource whose recorded kind differs from its declared kind is
/// rejected; the old kind's adapter would otherwise never see a delete.
pub fn plan(graph: &ResourceGraph, snapshot: &Snapshot) -> Result<Plan, CoreError> {
    let levels = graph.levels();
    let mut steps = Vec::new();

    for id in graph.topological_order() {
        let Some(node) = graph.get(id) else { continue };
        let kind = node.resource.kind;
        let hash = config_hash(kind, &node.resource.config)?;
        let action = match snapshot.resources.get(id) {
            None => Action::Create,
            Some(record) if record.kind != kind => {
                return Err(ValidationError::KindChanged {
                    id: id.clone(),
                    recorded: record.kind,
                    declared: kind,
                }
                .into());
            }
            Some(record) if record.config_hash != hash => Action::Update,
            Some(_) => Action::NoOp,
        };
        steps.push(PlanStep {
            key: id.to_string(),
            subject: StepSubject::Resource {
                id: id.clone(),
                kind,
            },
            action,
            level: levels.get(id).copied().unwrap_or(0),
            after: node.dependencies.iter().map(ToString::to_string).collect(),
            hash: Some(hash),
            config: node.resource.config.clone(),
            depends_on: node.dependencies.clone(),
        });
    }

    let desired = desired_bindings(graph);
    for (key, binding) in &desired {
        let hash = binding_hash(binding)?;
        let action = match snapshot.bindings.get(key) {
            None => Action::Create,
            Some(record) if record.hash != hash => Action::Update,
            Some(_) => Action::NoOp,
        };
        let endpoints: BTreeSet<&ResourceId> = binding.endpoints().into_iter().collect();
        let level = endpoints
            .iter()
            .filter_map(|e| levels.get(*e))
            .max()
            .copied()
            .unwrap_or(0);
        steps.push(PlanStep {
            key: key.clone(),
            subject: StepSubject::Binding(binding.clone()),
            action,
            level,
            after: endpoints.iter().map(ToString::to_string).collect(),
            hash: Some(hash),
            config: Config::new(),
            depends_on: BTreeSet::new(),
        });
    }

    let teardown = steps.iter().map(|s| s.level + 1).max().unwrap_or(0);
    teardown_steps(graph, &desired, snapshot, teardown, &mut steps);

    steps.sort_by(|a, b| {
        (a.level, a.is_binding(), &a.key).cmp(&(b.level, b.is_binding(), &b.key))
    });
    Ok(Plan { steps })
}

/// Plan that deletes every recorded resource and unbinds every recorded
/// binding.
pub fn plan_destroy(snapshot: &Snapshot) -> Result<Plan, CoreError> {
    plan(&ResourceGraph::default(), snapshot)
}

fn teardown_steps(
    graph: &ResourceGraph,
    desired: &BTreeMap<String, Binding>,
    snapshot: &Snapshot,
    first_level: usize,
    steps: &mut Vec<PlanStep>,
) {
    let mut unbinds_of: BTreeMap<&ResourceId, Vec<String>> = BTreeMap::new();
    let mut has_unbinds = false;
    for (key, record) in &snapshot.bindings {
        if desired.contains_key(key) {
            continue;
        }
        has_unbinds = true;
        for endpoint in record.binding.endpoints() {
            unbinds_of.entry(endpoint).or_default().push(key.clone());
        }
        steps.push(PlanStep {
            key: key.clone(),
            subject: StepSubject::Binding(record.binding.clone()),
            action: Action::Delete,
            level: first_level,
            after: Vec::new(),
            hash: None,
            config: Config::new(),
            depends_on: BTreeSet::new(),
        });
    }

    let deleted: BTreeSet<&ResourceId> = snapshot
        .resources
        .keys()
        .filter(|id| !graph.contains(id))
        .collect();
    if deleted.is_empty() {
        return;
    }

    // A resource is deleted only after every deleted resource that depended on it.
    let mut blockers: BTreeMap<&ResourceId, BTreeSet<&ResourceId>> =
        deleted.iter().map(|id| (*id, BTreeSet::new())).collect();
    for id in &deleted {
        for dep in &snapshot.resources[*id].depends_on {
            if let Some(set) = blockers.get_mut(dep) {
                set.insert(*id);
            }
        }
    }
    let delete_levels = reverse_levels(&blockers);
    let base = if has_unbinds { first_level + 1 } else { first_level };

    for id in deleted {
        let record = &snapshot.resources[id];
        let mut after: Vec<String> = blockers[id].iter().map(ToString::to_string).collect();
        if let Some(keys) = unbinds_of.get(id) {
            after.extend(keys.iter().cloned());
        }
        after.sort();
        after.dedup();
        steps.push(PlanStep {
            key: id.to_string(),
            subject: StepSubject::Resource {
                id: id.clone(),
                kind: record.kind,
            },
            action: Action::Delete,
            level: base + delete_levels.get(id).copied().unwrap_or(0),
            after,
            hash: None,
            config: Config::new(),
            depends_on: BTreeSet::new(),
        });
    }
}

/// Kahn's algorithm over the "must wait for" relation. Entries left over by
/// a cycle in recorded dependencies are placed after everything else.
fn reverse_levels<'a>(
    blockers: &BTreeMap<&'a ResourceId, BTreeSet<&'a ResourceId>>,
) -> BTreeMap<&'a ResourceId, usize> {
    let mut levels: BTreeMap<&ResourceId, usize> = BTreeMap::new();
    let mut pending: BTreeSet<&ResourceId> = blockers.keys().copied().collect();
    loop {
        let ready: Vec<&ResourceId> = pending
            .iter()
            .copied()
            .filter(|id| blockers[*id].iter().all(|b| levels.contains_key(*b)))
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            let level = blockers[id]
                .iter()
                .filter_map(|b| levels.get(*b))
                .max()
                .map_or(0, |l| l + 1);
            levels.insert(id, level);
            pending.remove(id);
        }
    }
    let fallback = levels.values().max().map_or(0, |l| l + 1);
    for id in pending {
        levels.insert(id, fallback);
    }
    levels
}
