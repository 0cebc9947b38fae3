//! Planner and executor properties over generated and hand-built graphs.

use cirrus_core::{
    plan, resolve_grants, Action, EngineSettings, Executor, ResourceGraph, RunOutcome, StepState,
    ValidationError,
};
use cirrus_provider::{AdapterTable, MockAdapter, Operation};
use cirrus_schema::{Capability, DesiredSpec, Grant, Resource, ResourceKind};
use cirrus_store::{MemoryStateStore, Snapshot, StateStore};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic xorshift so generated graphs are reproducible.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Random DAG: node i may depend only on nodes with a smaller index.
fn random_dag(seed: u64, size: usize) -> DesiredSpec {
    let mut rng = Rng(seed);
    let mut resources = Vec::with_capacity(size);
    for i in 0..size {
        let mut r = Resource::new(format!("r{i:03}"), ResourceKind::Role)
            .with_config("index", i as u64);
        for j in 0..i {
            if rng.below(4) == 0 {
                r = r.depends_on(format!("r{j:03}"));
            }
        }
        resources.push(r);
    }
    // Shuffle declaration order.
    for i in (1..resources.len()).rev() {
        let j = rng.below(i as u64 + 1) as usize;
        resources.swap(i, j);
    }
    DesiredSpec {
        resources,
        ..DesiredSpec::default()
    }
}

fn executor(mock: &Arc<MockAdapter>, store: &Arc<MemoryStateStore>) -> Executor {
    let settings = EngineSettings {
        retry: cirrus_core::RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..EngineSettings::default()
    };
    Executor::new(AdapterTable::uniform(mock.clone()), store.clone()).with_settings(&settings)
}

#[test]
fn topological_order_respects_every_edge() {
    for seed in 1..40 {
        let spec = random_dag(seed, 25);
        let graph = ResourceGraph::build(&spec).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), spec.resources.len());
        let position = |id: &str| order.iter().position(|o| o.as_str() == id).unwrap();
        let levels = graph.levels();
        for node in graph.nodes() {
            for dep in &node.dependencies {
                assert!(
                    position(dep.as_str()) < position(node.resource.id.as_str()),
                    "seed {seed}"
                );
                assert!(levels[dep] < levels[&node.resource.id], "seed {seed}");
            }
        }
    }
}

#[test]
fn closing_any_edge_backwards_is_a_cycle() {
    let mut spec = random_dag(7, 10);
    spec.resources.sort_by(|a, b| a.id.cmp(&b.id));
    spec.resources[0] = spec.resources[0].clone().depends_on("r009");
    spec.resources[9] = spec.resources[9].clone().depends_on("r000");
    match ResourceGraph::build(&spec) {
        Err(ValidationError::Cycle(cycle)) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.len() >= 3);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[test]
fn planning_is_deterministic_across_declaration_orders() {
    let spec = random_dag(11, 30);
    let mut reversed = spec.clone();
    reversed.resources.reverse();
    let a = plan(&ResourceGraph::build(&spec).unwrap(), &Snapshot::empty()).unwrap();
    let b = plan(&ResourceGraph::build(&reversed).unwrap(), &Snapshot::empty()).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
}

#[test]
fn subsumption_in_either_order() {
    let forward = resolve_grants(&[
        Grant::new("fn", "data", Capability::Read),
        Grant::new("fn", "data", Capability::ReadWrite),
    ]);
    let backward = resolve_grants(&[
        Grant::new("fn", "data", Capability::ReadWrite),
        Grant::new("fn", "data", Capability::Read),
    ]);
    assert_eq!(forward, backward);
    assert_eq!(forward, vec![Grant::new("fn", "data", Capability::ReadWrite)]);
}

#[tokio::test]
async fn apply_then_replan_is_all_noop() {
    let mock = Arc::new(MockAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    let spec = random_dag(3, 20);
    let graph = ResourceGraph::build(&spec).unwrap();

    let first = plan(&graph, &store.load().unwrap()).unwrap();
    let report = executor(&mock, &store).execute(&first).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let second = plan(&graph, &store.load().unwrap()).unwrap();
    assert!(second.steps.iter().all(|s| s.action == Action::NoOp));
}

#[tokio::test]
async fn isolated_update_touches_one_resource() {
    let mock = Arc::new(MockAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    let spec = random_dag(5, 15);
    let graph = ResourceGraph::build(&spec).unwrap();
    executor(&mock, &store)
        .execute(&plan(&graph, &store.load().unwrap()).unwrap())
        .await
        .unwrap();

    let mut changed = spec.clone();
    let target = changed
        .resources
        .iter_mut()
        .find(|r| r.id == "r004")
        .unwrap();
    target.config.insert("index".to_owned(), serde_json::json!(400));
    let replanned = plan(&ResourceGraph::build(&changed).unwrap(), &store.load().unwrap()).unwrap();
    let updates: Vec<&str> = replanned
        .steps
        .iter()
        .filter(|s| s.action != Action::NoOp)
        .map(|s| s.key.as_str())
        .collect();
    assert_eq!(updates, vec!["r004"]);
    assert_eq!(replanned.get("r004").unwrap().action, Action::Update);
}

#[tokio::test]
async fn adapter_calls_follow_dependency_order() {
    let mock = Arc::new(MockAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    let spec = random_dag(13, 20);
    let graph = ResourceGraph::build(&spec).unwrap();
    executor(&mock, &store)
        .execute(&plan(&graph, &Snapshot::empty()).unwrap())
        .await
        .unwrap();

    let calls = mock.calls();
    let position = |id: &str| {
        calls
            .iter()
            .position(|c| c.key == id && c.op == Operation::Create)
            .unwrap()
    };
    for node in graph.nodes() {
        for dep in &node.dependencies {
            assert!(position(dep.as_str()) < position(node.resource.id.as_str()));
        }
    }
}

#[tokio::test]
async fn in_flight_operations_are_bounded() {
    let mock = Arc::new(MockAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    let resources: Vec<Resource> = (0..8)
        .map(|i| {
            let id = format!("bucket-{i}");
            mock.delay(&id, Duration::from_millis(20));
            Resource::new(id, ResourceKind::Bucket)
        })
        .collect();
    let spec = DesiredSpec {
        resources,
        ..DesiredSpec::default()
    };
    let settings = EngineSettings {
        max_in_flight: 3,
        ..EngineSettings::default()
    };
    let executor =
        Executor::new(AdapterTable::uniform(mock.clone()), store.clone()).with_settings(&settings);
    let report = executor
        .execute(&plan(&ResourceGraph::build(&spec).unwrap(), &Snapshot::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert!(mock.peak_in_flight() <= 3);
    assert!(mock.peak_in_flight() >= 2);
}

#[tokio::test]
async fn timeouts_exhaust_retries_and_fail_the_step() {
    let mock = Arc::new(MockAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    mock.delay("slow", Duration::from_secs(5));
    let spec = DesiredSpec {
        resources: vec![
            Resource::new("slow", ResourceKind::Bucket),
            Resource::new("quick", ResourceKind::Bucket),
        ],
        ..DesiredSpec::default()
    };
    let report = executor(&mock, &store)
        .with_op_timeout(Duration::from_millis(30))
        .execute(&plan(&ResourceGraph::build(&spec).unwrap(), &Snapshot::empty()).unwrap())
        .await
        .unwrap();

    let slow = report.step("slow").unwrap();
    assert_eq!(slow.state, StepState::Failed);
    assert_eq!(slow.attempts, 3);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(report.step("quick").unwrap().state, StepState::Applied);
    assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
}

#[test]
fn removing_a_depended_on_resource_alone_is_rejected() {
    let spec = DesiredSpec {
        resources: vec![Resource::new("y", ResourceKind::ComputeFunction).depends_on("x")],
        ..DesiredSpec::default()
    };
    assert!(matches!(
        ResourceGraph::build(&spec),
        Err(ValidationError::DanglingReference { .. })
    ));
}

#[tokio::test]
async fn removing_both_deletes_dependent_first() {
    let mock = Arc::new(MockAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    let spec = DesiredSpec {
        resources: vec![
            Resource::new("x", ResourceKind::Role),
            Resource::new("y", ResourceKind::ComputeFunction).depends_on("x"),
            Resource::new("z", ResourceKind::Bucket),
        ],
        ..DesiredSpec::default()
    };
    executor(&mock, &store)
        .execute(&plan(&ResourceGraph::build(&spec).unwrap(), &Snapshot::empty()).unwrap())
        .await
        .unwrap();

    let remaining = DesiredSpec {
        resources: vec![Resource::new("z", ResourceKind::Bucket)],
        ..DesiredSpec::default()
    };
    let teardown = plan(&ResourceGraph::build(&remaining).unwrap(), &store.load().unwrap()).unwrap();
    let x = teardown.get("x").unwrap();
    let y = teardown.get("y").unwrap();
    assert_eq!((x.action, y.action), (Action::Delete, Action::Delete));
    assert!(y.level < x.level);

    let report = executor(&mock, &store).execute(&teardown).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    let calls = mock.calls();
    let delete_of = |id: &str| {
        calls
            .iter()
            .position(|c| c.key == id && c.op == Operation::Delete)
            .unwrap()
    };
    assert!(delete_of("y") < delete_of("x"));
    assert_eq!(store.snapshot().resources.len(), 1);
}
