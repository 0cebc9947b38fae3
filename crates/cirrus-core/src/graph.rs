use cirrus_schema::{
    references, DesiredSpec, Grant, HttpMethod, OutputRef, Resource, ResourceId, ResourceKind,
    Route, Trigger,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate resource id '{0}'")]
    DuplicateId(ResourceId),
    #[error("{context} references undeclared resource '{missing}'")]
    DanglingReference {
        context: String,
        missing: ResourceId,
    },
    #[error("dependency cycle: {}", format_cycle(.0))]
    Cycle(Vec<ResourceId>),
    #[error("{context}: '{id}' is a {found}, expected {expected}")]
    InvalidTarget {
        context: String,
        id: ResourceId,
        expected: ResourceKind,
        found: ResourceKind,
    },
    #[error("duplicate route {method} {path}")]
    DuplicateRoute { method: HttpMethod, path: String },
    #[error("invalid route path '{path}': {reason}")]
    InvalidRoute { path: String, reason: String },
    #[error("resource '{id}' is recorded as a {recorded} but declared as a {declared}; remove it and apply before redeclaring")]
    KindChanged {
        id: ResourceId,
        recorded: ResourceKind,
        declared: ResourceKind,
    },
    #[error("resource '{resource}': {reason}")]
    UnresolvedReference {
        resource: ResourceId,
        reason: String,
    },
}

fn format_cycle(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ResourceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub resource: Resource,
    /// Declared plus implied dependencies.
    pub dependencies: BTreeSet<ResourceId>,
    #[serde(skip)]
    pub references: BTreeSet<OutputRef>,
}

/// Validated, acyclic desired state.
///
/// Edges point from a resource to what it depends on. Besides `depends_on`,
/// edges are implied by config output references, by grants (subject on
/// target), by route gateways (gateway on target) and by trigger rules (rule
/// on target).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceGraph {
    nodes: BTreeMap<ResourceId, Node>,
    grants: Vec<Grant>,
    routes: Vec<Route>,
    triggers: Vec<Trigger>,
}

impl ResourceGraph {
    pub fn build(spec: &DesiredSpec) -> Result<Self, ValidationError> {
        let mut nodes = BTreeMap::new();
        for resource in &spec.resources {
            if nodes.contains_key(&resource.id) {
                return Err(ValidationError::DuplicateId(resource.id.clone()));
            }
            let refs = references(&resource.config).map_err(|e| {
                ValidationError::UnresolvedReference {
                    resource: resource.id.clone(),
                    reason: e.to_string(),
                }
            })?;
            nodes.insert(
                resource.id.clone(),
                Node {
                    resource: resource.clone(),
                    dependencies: resource.depends_on.clone(),
                    references: refs,
                },
            );
        }

        for (id, node) in &nodes {
            for dep in &node.resource.depends_on {
                require(&nodes, dep, || format!("depends_on of '{id}'"))?;
            }
            for r in &node.references {
                require(&nodes, &r.resource, || {
                    format!("output reference '${{{}.{}}}' in '{id}'", r.resource, r.output)
                })?;
            }
        }

        let mut implied: Vec<(ResourceId, ResourceId)> = Vec::new();
        for node in nodes.values() {
            for r in &node.references {
                implied.push((node.resource.id.clone(), r.resource.clone()));
            }
        }

        for grant in &spec.grants {
            let context = || format!("grant {} -> {}", grant.subject, grant.target);
            require(&nodes, &grant.subject, context)?;
            require(&nodes, &grant.target, context)?;
            implied.push((grant.subject.clone(), grant.target.clone()));
        }

        let mut seen_routes = BTreeSet::new();
        for route in &spec.routes {
            let context = || format!("route {} {}", route.method, route.path);
            validate_path(&route.path)?;
            if !seen_routes.insert((route.method, route.path.as_str())) {
                return Err(ValidationError::DuplicateRoute {
                    method: route.method,
                    path: route.path.clone(),
                });
            }
            expect_kind(&nodes, &route.target, ResourceKind::ComputeFunction, context)?;
            if let Some(gateway) = &route.gateway {
                expect_kind(&nodes, gateway, ResourceKind::ApiGateway, context)?;
                implied.push((gateway.clone(), route.target.clone()));
            }
        }

        for trigger in &spec.triggers {
            let context = || format!("trigger {} -> {}", trigger.schedule, trigger.target);
            expect_kind(&nodes, &trigger.target, ResourceKind::ComputeFunction, context)?;
            if let Some(rule) = &trigger.rule {
                expect_kind(&nodes, rule, ResourceKind::ScheduleRule, context)?;
                implied.push((rule.clone(), trigger.target.clone()));
            }
        }

        for (from, to) in implied {
            if let Some(node) = nodes.get_mut(&from) {
                node.dependencies.insert(to);
            }
        }

        if let Some(cycle) = find_cycle(&nodes) {
            return Err(ValidationError::Cycle(cycle));
        }

        Ok(Self {
            nodes,
            grants: spec.grants.clone(),
            routes: spec.routes.clone(),
            triggers: spec.triggers.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn kind_of(&self, id: &str) -> Option<ResourceKind> {
        self.nodes.get(id).map(|n| n.resource.kind)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<ResourceId>> {
        self.nodes.get(id).map(|n| &n.dependencies)
    }

    /// Resources that depend directly on `id`.
    pub fn dependents(&self, id: &str) -> BTreeSet<&ResourceId> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(id))
            .map(|n| &n.resource.id)
            .collect()
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Dependencies before dependents; ties broken by ascending id.
    pub fn topological_order(&self) -> Vec<&ResourceId> {
        let mut remaining: BTreeMap<&ResourceId, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id, n.dependencies.len()))
            .collect();
        let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            for dep in &node.dependencies {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut ready: BTreeSet<&ResourceId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }

    /// level(n) = 0 without dependencies, else 1 + the highest dependency level.
    pub fn levels(&self) -> BTreeMap<&ResourceId, usize> {
        let mut levels: BTreeMap<&ResourceId, usize> = BTreeMap::new();
        for id in self.topological_order() {
            let level = self.nodes[id]
                .dependencies
                .iter()
                .filter_map(|d| levels.get(d))
                .max()
                .map_or(0, |l| l + 1);
            levels.insert(id, level);
        }
        levels
    }
}

fn require<F>(
    nodes: &BTreeMap<ResourceId, Node>,
    id: &ResourceId,
    context: F,
) -> Result<ResourceKind, ValidationError>
where
    F: Fn() -> String,
{
    nodes
        .get(id)
        .map(|n| n.resource.kind)
        .ok_or_else(|| ValidationError::DanglingReference {
            context: context(),
            missing: id.clone(),
        })
}

fn expect_kind<F>(
    nodes: &BTreeMap<ResourceId, Node>,
    id: &ResourceId,
    expected: ResourceKind,
    context: F,
) -> Result<(), ValidationError>
where
    F: Fn() -> String,
{
    let found = require(nodes, id, &context)?;
    if found == expected {
        Ok(())
    } else {
        Err(ValidationError::InvalidTarget {
            context: context(),
            id: id.clone(),
            expected,
            found,
        })
    }
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    let reason = if !path.starts_with('/') {
        Some("must start with '/'")
    } else if path.chars().any(char::is_whitespace) {
        Some("must not contain whitespace")
    } else if path.contains(['?', '#']) {
        Some("must not contain a query or fragment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ValidationError::InvalidRoute {
            path: path.to_owned(),
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}

/// First cycle found walking ids in ascending order, with the starting id
/// repeated at the end.
fn find_cycle(nodes: &BTreeMap<ResourceId, Node>) -> Option<Vec<ResourceId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a ResourceId,
        nodes: &'a BTreeMap<ResourceId, Node>,
        marks: &mut BTreeMap<&'a ResourceId, Mark>,
        stack: &mut Vec<&'a ResourceId>,
    ) -> Option<Vec<ResourceId>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id)?;
                let mut cycle: Vec<ResourceId> =
                    stack[start..].iter().map(|s| (*s).clone()).collect();
                cycle.push(id.clone());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(node) = nodes.get(id) {
            for dep in &node.dependencies {
                if let Some(cycle) = visit(dep, nodes, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    nodes
        .keys()
        .find_map(|id| visit(id, nodes, &mut marks, &mut stack))
}
