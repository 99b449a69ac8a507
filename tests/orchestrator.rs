use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use provenant::registry::{ConfigSchema, FieldKind};
use provenant::{
    Artifact, ArtifactStore, Orchestrator, PipelineError, RetryPolicy, StageError, StageExecutor,
    StageOutput, StageRegistry, StageRequest, StageSpec,
};
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

type Outcome = Result<StageOutput, StageError>;

struct Counted<F> {
    calls: Arc<AtomicUsize>,
    inner: F,
}

impl<F> StageExecutor for Counted<F>
where
    F: Fn(&Value, &[Artifact]) -> Outcome + Send + Sync,
{
    fn run(&self, config: &Value, inputs: &[Artifact]) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.inner)(config, inputs)
    }
}

fn counted<F>(inner: F) -> (Counted<F>, Arc<AtomicUsize>)
where
    F: Fn(&Value, &[Artifact]) -> Outcome + Send + Sync,
{
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Counted {
            calls: Arc::clone(&calls),
            inner,
        },
        calls,
    )
}

/// Payload echoes the config and the ids of the inputs.
fn echo(config: &Value, inputs: &[Artifact]) -> Outcome {
    let ids: Vec<&str> = inputs.iter().map(|a| a.id.as_str()).collect();
    Ok(StageOutput::new(json!({"config": config, "inputs": ids})))
}

struct Fixture {
    _temp: TempDir,
    store: Arc<ArtifactStore>,
    calls: Vec<(&'static str, Arc<AtomicUsize>)>,
}

impl Fixture {
    fn calls(&self, stage: &str) -> usize {
        self.calls
            .iter()
            .find(|(name, _)| *name == stage)
            .map(|(_, calls)| calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// datasets -> workload_instances -> plans -> circuits, all echoing.
fn experiment_chain() -> (Fixture, Orchestrator) {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let mut registry = StageRegistry::new();
    let mut calls = Vec::new();
    for (stage, inputs) in [
        ("datasets", vec![]),
        ("workload_instances", vec!["datasets"]),
        ("plans", vec!["workload_instances"]),
        ("circuits", vec!["plans"]),
    ] {
        let (executor, counter) = counted(echo);
        registry
            .register(StageSpec::new(stage).with_inputs(inputs), executor)
            .unwrap();
        calls.push((stage, counter));
    }
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(registry));
    (
        Fixture {
            _temp: temp,
            store,
            calls,
        },
        orchestrator,
    )
}

fn dataset(name: &str) -> StageRequest {
    StageRequest::new("datasets", json!({"name": name}))
}

fn workload(dataset: StageRequest) -> StageRequest {
    StageRequest::new("workload_instances", json!({"template": "q6", "count": 4}))
        .with_upstream(dataset)
}

fn circuit(kernel: Value) -> StageRequest {
    StageRequest::new("circuits", kernel).with_upstream(
        StageRequest::new("plans", json!({"planner": "simple"})).with_upstream(workload(dataset("tpch"))),
    )
}

#[tokio::test]
async fn repeated_build_reuses_every_artifact() {
    let (fixture, orchestrator) = experiment_chain();
    let cancel = CancellationToken::new();
    let request = workload(dataset("tpch"));

    let first = orchestrator.build(&request, &cancel).await.unwrap();
    let writes = fixture.store.stats().published;
    let second = orchestrator.build(&request, &cancel).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.input_ids(), second.input_ids());
    assert_eq!(writes, 2);
    assert_eq!(fixture.store.stats().published, 2);
    assert_eq!(fixture.calls("datasets"), 1);
    assert_eq!(fixture.calls("workload_instances"), 1);
    let snapshot = orchestrator.metrics().snapshot();
    assert_eq!(snapshot.cache_hits("workload_instances"), 1);
}

#[tokio::test]
async fn kernel_change_leaves_upstream_ids_alone() {
    let (_fixture, orchestrator) = experiment_chain();
    let cancel = CancellationToken::new();

    let grover = orchestrator
        .build(&circuit(json!({"kernel": "grover", "iterations": 2})), &cancel)
        .await
        .unwrap();
    let mlae = orchestrator
        .build(&circuit(json!({"kernel": "grover", "iterations": 3})), &cancel)
        .await
        .unwrap();

    assert_ne!(grover.id, mlae.id);
    assert_eq!(grover.input_ids(), mlae.input_ids());
}

#[tokio::test]
async fn executor_failure_publishes_nothing() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let mut registry = StageRegistry::new();
    registry
        .register(StageSpec::new("jobs"), |_: &Value, _: &[Artifact]| -> Outcome {
            Err(StageError::fatal("backend rejected circuit"))
        })
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(registry));
    let request = StageRequest::new("jobs", json!({"shots": 100}));

    let err = orchestrator
        .build(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "StageExecutionError");
    let plan = orchestrator.plan(&request).unwrap();
    assert!(!store.exists(&plan.target));
    assert!(store.list("jobs").unwrap().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let (executor, calls) = counted(move |config: &Value, _: &[Artifact]| -> Outcome {
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(StageError::transient("queue busy"))
        } else {
            Ok(StageOutput::new(config.clone()))
        }
    });
    let mut registry = StageRegistry::new();
    registry
        .register(
            StageSpec::new("jobs")
                .non_deterministic()
                .with_retry(RetryPolicy::attempts(3, Duration::from_millis(5))),
            executor,
        )
        .unwrap();
    let orchestrator = Orchestrator::new(store, Arc::new(registry));

    let artifact = orchestrator
        .build(&StageRequest::new("jobs", json!({"shots": 10})), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(artifact.payload, json!({"shots": 10}));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(orchestrator.metrics().snapshot().stages["jobs"].retries, 2);
}

#[tokio::test]
async fn exhausted_retries_become_fatal() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let (executor, calls) = counted(|_: &Value, _: &[Artifact]| -> Outcome {
        Err(StageError::transient("queue busy"))
    });
    let mut registry = StageRegistry::new();
    registry
        .register(
            StageSpec::new("jobs").with_retry(RetryPolicy::attempts(2, Duration::from_millis(1))),
            executor,
        )
        .unwrap();
    let orchestrator = Orchestrator::new(store, Arc::new(registry));

    let err = orchestrator
        .build(&StageRequest::new("jobs", json!({})), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match err {
        PipelineError::StageExecution {
            attempts,
            retryable,
            ..
        } => {
            assert_eq!(attempts, 2);
            assert!(retryable);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn slow_stage_times_out_without_publishing() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let mut registry = StageRegistry::new();
    registry
        .register(
            StageSpec::new("compiled").with_timeout(Duration::from_millis(50)),
            |config: &Value, _: &[Artifact]| -> Outcome {
                thread::sleep(Duration::from_millis(500));
                Ok(StageOutput::new(config.clone()))
            },
        )
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(registry));

    let err = orchestrator
        .build(&StageRequest::new("compiled", json!({})), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "Timeout");
    assert!(store.list("compiled").unwrap().is_empty());
}

#[tokio::test]
async fn shared_ancestor_runs_once_under_fan_out() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let (slow_dataset, dataset_calls) = counted(|config: &Value, _: &[Artifact]| -> Outcome {
        thread::sleep(Duration::from_millis(50));
        Ok(StageOutput::new(config.clone()))
    });
    let mut registry = StageRegistry::new();
    registry.register(StageSpec::new("datasets"), slow_dataset).unwrap();
    registry
        .register(StageSpec::new("circuits").with_inputs(["datasets"]), echo)
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(registry));
    let cancel = CancellationToken::new();

    let requests: Vec<StageRequest> = (0..6)
        .map(|variant| {
            StageRequest::new("circuits", json!({"variant": variant})).with_upstream(dataset("tpch"))
        })
        .collect();
    let results = join_all(requests.iter().map(|r| orchestrator.build(r, &cancel))).await;

    let circuits: Vec<Artifact> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(dataset_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.list("circuits").unwrap().len(), 6);
    assert!(
        circuits
            .windows(2)
            .all(|pair| pair[0].input_ids() == pair[1].input_ids())
    );
}

#[tokio::test]
async fn concurrent_requests_for_one_id_execute_once() {
    let (fixture, orchestrator) = experiment_chain();
    let cancel = CancellationToken::new();
    let request = workload(dataset("tpch"));

    let results = join_all((0..4).map(|_| orchestrator.build(&request, &cancel))).await;
    let ids: Vec<_> = results.into_iter().map(|r| r.unwrap().id).collect();

    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(fixture.calls("datasets"), 1);
    assert_eq!(fixture.calls("workload_instances"), 1);
}

#[tokio::test]
async fn cancelled_build_stops_before_executing() {
    let (fixture, orchestrator) = experiment_chain();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator
        .build(&workload(dataset("tpch")), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "Cancelled");
    assert_eq!(fixture.calls("datasets"), 0);
    assert!(fixture.store.list("datasets").unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_aborts_a_running_stage() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let mut registry = StageRegistry::new();
    registry
        .register(StageSpec::new("jobs"), |config: &Value, _: &[Artifact]| -> Outcome {
            thread::sleep(Duration::from_millis(300));
            Ok(StageOutput::new(config.clone()))
        })
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(registry));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .build(&StageRequest::new("jobs", json!({})), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "Cancelled");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.list("jobs").unwrap().is_empty());
}

#[tokio::test]
async fn wrong_input_stage_is_a_config_error() {
    let (fixture, orchestrator) = experiment_chain();
    let request = StageRequest::new("plans", json!({})).with_upstream(dataset("tpch"));

    let err = orchestrator
        .build(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "ConfigError");
    assert!(err.to_string().contains("must come from 'workload_instances'"));
    assert_eq!(fixture.calls("plans"), 0);
}

#[tokio::test]
async fn missing_required_config_field_fails_before_execution() {
    let temp = tempdir().unwrap();
    let store = Arc::new(ArtifactStore::open(temp.path()).unwrap());
    let (executor, calls) = counted(echo);
    let mut registry = StageRegistry::new();
    registry
        .register(
            StageSpec::new("datasets")
                .with_schema(ConfigSchema::default().require("name", FieldKind::String)),
            executor,
        )
        .unwrap();
    let orchestrator = Orchestrator::new(store, Arc::new(registry));

    let err = orchestrator
        .build(&StageRequest::new("datasets", json!({"scale": 1})), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "ConfigError");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn artifact_inputs_must_exist() {
    let (_fixture, orchestrator) = experiment_chain();
    let missing = "c".repeat(64).parse().unwrap();
    let request = StageRequest::new("workload_instances", json!({})).with_artifact(missing);

    let err = orchestrator
        .build(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");
}

#[tokio::test]
async fn separate_stores_produce_identical_bytes() {
    let request = circuit(json!({
        "kernel": "qaoa",
        "gamma": 0.18895018582774542,
        "beta": [0.1, 0.2, 0.30000000000000004, 2.5e-9],
        "depth": 3.0,
    }));
    let cancel = CancellationToken::new();

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let (fixture, orchestrator) = experiment_chain();
        let built = orchestrator.build(&request, &cancel).await.unwrap();
        let plan = orchestrator.plan(&request).unwrap();
        let ids: Vec<_> = plan.nodes.iter().map(|n| n.artifact_id.clone()).collect();
        let payload = std::fs::read(
            fixture
                .store
                .root()
                .join("circuits")
                .join(built.id.as_str())
                .join("payload.json"),
        )
        .unwrap();
        outcomes.push((built.id, ids, payload));
    }

    assert_eq!(outcomes[0].0, outcomes[1].0);
    assert_eq!(outcomes[0].1, outcomes[1].1);
    assert_eq!(outcomes[0].2, outcomes[1].2);
    let written: Value = serde_json::from_slice(&outcomes[0].2).unwrap();
    assert_eq!(written["config"]["gamma"], json!(0.18895018582774542));
}
