mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use common::{engine, experiment, linear_pipeline, sample, spec};
use cytoflow_engine::config::EngineConfig;
use cytoflow_engine::engine::Engine;
use cytoflow_engine::error::{PayloadError, PersistenceError};
use cytoflow_engine::registry::{CancelToken, StageFailure};
use cytoflow_engine::retry::RetryPolicy;
use cytoflow_engine::scheduler::{ParallelismPolicy, WorkerPlan};
use cytoflow_engine::store::{Collection, DocumentStore, MemoryBlobStore, MemoryDocumentStore, StoreHandle};
use cytoflow_engine::{
    ArtifactType, EngineError, Payload, RunStatus, StageDefinition, StageStatus, default_registry,
};
use serde_json::{Value, json};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 1,
        backoff_multiplier: 1.0,
        max_backoff_ms: 5,
    }
}

fn passthrough_definition(name: &str) -> StageDefinition {
    StageDefinition::new(name, 1, ArtifactType::Table).input("data", ArtifactType::Table)
}

#[test]
fn failure_skips_only_downstream_nodes() {
    let mut registry = default_registry().unwrap();
    registry
        .register_fn(passthrough_definition("explode"), |_, _, _| {
            Err(StageFailure::deterministic("boom"))
        })
        .unwrap();
    let engine = engine(registry, 1);
    let exp = experiment(
        &engine,
        &[
            spec("a", "normalize", json!({}), &["sample:S1"]),
            spec("b", "explode", json!({}), &["stage:a"]),
            spec("c", "normalize", json!({}), &["stage:b"]),
            spec("d", "normalize", json!({}), &["stage:c"]),
            spec("side", "normalize", json!({"method": "linear"}), &["sample:S1"]),
        ],
    );

    let provenance = engine.run_experiment(&exp).unwrap();
    assert_eq!(provenance.run.status, RunStatus::Failed);
    assert_eq!(provenance.stage("a").unwrap().status, StageStatus::Computed);
    assert_eq!(provenance.stage("side").unwrap().status, StageStatus::Computed);

    let failed = provenance.stage("b").unwrap();
    assert_eq!(failed.status, StageStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("boom"));

    for node in ["c", "d"] {
        let record = provenance.stage(node).unwrap();
        assert_eq!(record.status, StageStatus::Skipped);
        assert_eq!(record.skip_reason.as_deref(), Some("upstream node 'b' failed"));
    }
    let first = provenance.first_failure.as_ref().unwrap();
    assert_eq!(first.stage_instance_id, "b");
    assert_eq!(provenance.skipped, vec!["c", "d"]);
}

#[test]
fn resume_keeps_completed_nodes() {
    let healthy = Arc::new(AtomicBool::new(false));
    let mut registry = default_registry().unwrap();
    let flag = Arc::clone(&healthy);
    registry
        .register_fn(passthrough_definition("toggle"), move |inputs, _, _| {
            if flag.load(Ordering::SeqCst) {
                Ok(Payload::Table(inputs.table("data")?.clone()))
            } else {
                Err(StageFailure::deterministic("instrument calibration missing"))
            }
        })
        .unwrap();
    let engine = engine(registry, 2);
    let exp = experiment(
        &engine,
        &[
            spec("a", "normalize", json!({}), &["sample:S1"]),
            spec("b", "toggle", json!({}), &["stage:a"]),
            spec("c", "normalize", json!({"method": "log"}), &["stage:b"]),
        ],
    );

    let failed = engine.run_experiment(&exp).unwrap();
    assert_eq!(failed.run.status, RunStatus::Failed);
    assert_eq!(failed.skipped, vec!["c"]);

    healthy.store(true, Ordering::SeqCst);
    let resumed = engine.resume_run(&failed.run.id).unwrap();
    assert_eq!(resumed.run.id, failed.run.id);
    assert_eq!(resumed.run.status, RunStatus::Succeeded);
    assert_eq!(resumed.run.attempt, 2);
    assert_eq!(resumed.stage("a"), failed.stage("a"), "completed node is reused untouched");
    assert_eq!(resumed.stage("b").unwrap().status, StageStatus::Computed);
    assert_eq!(resumed.stage("c").unwrap().status, StageStatus::Computed);
}

#[test]
fn tampered_artifact_aborts_the_run() {
    let engine = engine(default_registry().unwrap(), 1);
    let exp = experiment(&engine, &linear_pipeline(2));
    let first = engine.run_experiment(&exp).unwrap();

    let key = first.stage("norm").unwrap().artifact_key.clone().unwrap();
    engine
        .artifacts()
        .handle()
        .write_blob(&key.locator(), br#"{"type":"labels","data":[1]}"#)
        .unwrap();

    let err = engine.run_experiment(&exp).unwrap_err();
    assert!(matches!(err, EngineError::DataIntegrity(_)), "unexpected error: {err}");

    let runs = engine.experiments().list_runs(&exp).unwrap();
    let aborted = runs.iter().find(|r| r.id != first.run.id).unwrap();
    assert_eq!(aborted.status, RunStatus::Failed);

    let provenance = engine.get_run_provenance(&aborted.id).unwrap();
    assert_eq!(provenance.stage("norm").unwrap().status, StageStatus::Failed);
    for node in ["clust", "report"] {
        assert_eq!(provenance.stage(node).unwrap().status, StageStatus::Skipped);
    }
}

#[test]
fn transient_failures_are_retried_and_recorded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = default_registry().unwrap();
    let counter = Arc::clone(&calls);
    registry
        .register_fn(
            passthrough_definition("remote").retryable(fast_retry(3)),
            move |inputs, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StageFailure::transient("service busy"))
                } else {
                    Ok(Payload::Table(inputs.table("data")?.clone()))
                }
            },
        )
        .unwrap();
    let engine = engine(registry, 1);
    let exp = experiment(&engine, &[spec("r", "remote", json!({}), &["sample:S1"])]);

    let provenance = engine.run_experiment(&exp).unwrap();
    let record = provenance.stage("r").unwrap();
    assert_eq!(record.status, StageStatus::Computed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.decisions.len(), 2);
    assert!(record.decisions.iter().all(|d| d.contains("retrying")));
    assert_eq!(engine.metrics().snapshot().stages["remote"].retries, 2);
}

#[test]
fn retries_stop_where_policy_says_so() {
    let mut registry = default_registry().unwrap();
    registry
        .register_fn(passthrough_definition("busy"), |_, _, _| {
            Err(StageFailure::transient("service busy"))
        })
        .unwrap();
    registry
        .register_fn(
            passthrough_definition("always-busy").retryable(fast_retry(2)),
            |_, _, _| Err(StageFailure::transient("service busy")),
        )
        .unwrap();
    registry
        .register_fn(
            passthrough_definition("broken").retryable(fast_retry(5)),
            |_, _, _| Err(StageFailure::deterministic("bad panel")),
        )
        .unwrap();
    let engine = engine(registry, 3);
    let exp = experiment(
        &engine,
        &[
            spec("once", "busy", json!({}), &["sample:S1"]),
            spec("twice", "always-busy", json!({}), &["sample:S1"]),
            spec("never", "broken", json!({}), &["sample:S1"]),
        ],
    );

    let provenance = engine.run_experiment(&exp).unwrap();
    let expectations = [
        ("once", 1, "stage is not retryable"),
        ("twice", 2, "retry budget exhausted"),
        ("never", 1, "failure is not transient"),
    ];
    for (node, attempts, reason) in expectations {
        let record = provenance.stage(node).unwrap();
        assert_eq!(record.status, StageStatus::Failed, "{node}");
        assert_eq!(record.attempts, attempts, "{node}");
        assert!(record.decisions.last().unwrap().contains(reason), "{node}: {:?}", record.decisions);
    }
}

#[test]
fn stages_exceeding_their_timeout_fail() {
    let mut registry = default_registry().unwrap();
    registry
        .register_fn(
            passthrough_definition("slow").timeout(Duration::from_millis(50)),
            |inputs, _, ctx| {
                for _ in 0..500 {
                    ctx.checkpoint()?;
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(Payload::Table(inputs.table("data")?.clone()))
            },
        )
        .unwrap();
    let engine = engine(registry, 1);
    let exp = experiment(&engine, &[spec("s", "slow", json!({}), &["sample:S1"])]);

    let provenance = engine.run_experiment(&exp).unwrap();
    let record = provenance.stage("s").unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("timed out"));
}

#[test]
fn cancelled_runs_skip_everything_left() {
    let engine = engine(default_registry().unwrap(), 1);
    let exp = experiment(&engine, &linear_pipeline(2));
    let cancel = CancelToken::new();
    cancel.cancel();

    let provenance = engine.run_experiment_with_cancel(&exp, cancel).unwrap();
    assert_eq!(provenance.run.status, RunStatus::Failed);
    assert_eq!(provenance.count(StageStatus::Skipped), 3);
    assert!(
        provenance
            .stages
            .iter()
            .all(|s| s.skip_reason.as_deref() == Some("run aborted"))
    );
}

/// Rejects every third write once; the next attempt goes through.
#[derive(Default)]
struct FlakyDocuments {
    inner: MemoryDocumentStore,
    puts: AtomicUsize,
    failures: AtomicUsize,
    always_fail: bool,
}

impl DocumentStore for FlakyDocuments {
    fn put(&self, collection: Collection, id: &str, document: &Value) -> Result<(), PersistenceError> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || n % 3 == 1 {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(PersistenceError::Unavailable("connection reset".into()));
        }
        self.inner.put(collection, id, document)
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, PersistenceError> {
        self.inner.get(collection, id)
    }

    fn list(&self, collection: Collection) -> Result<Vec<Value>, PersistenceError> {
        self.inner.list(collection)
    }
}

fn flaky_engine(documents: Arc<FlakyDocuments>) -> Engine {
    let store = StoreHandle::new(documents, Arc::new(MemoryBlobStore::default()))
        .with_retry(fast_retry(3));
    Engine::new(
        default_registry().unwrap(),
        store,
        WorkerPlan::new(ParallelismPolicy::Serial, None),
    )
}

#[test]
fn transient_store_errors_are_retried() {
    let documents = Arc::new(FlakyDocuments::default());
    let engine = flaky_engine(Arc::clone(&documents));
    let exp = experiment(&engine, &linear_pipeline(2));

    let provenance = engine.run_experiment(&exp).unwrap();
    assert_eq!(provenance.run.status, RunStatus::Succeeded);
    assert!(documents.failures.load(Ordering::SeqCst) > 0);
}

#[test]
fn persistent_store_outage_surfaces_as_persistence_error() {
    let documents = Arc::new(FlakyDocuments {
        always_fail: true,
        ..FlakyDocuments::default()
    });
    let engine = flaky_engine(Arc::clone(&documents));

    let err = engine.create_experiment("exp", "tester").unwrap_err();
    assert!(matches!(err, EngineError::Persistence(PersistenceError::Unavailable(_))));
    assert_eq!(documents.failures.load(Ordering::SeqCst), 3);
}

#[test]
fn fixing_a_failed_node_recomputes_only_it_and_downstream() {
    let engine = engine(default_registry().unwrap(), 1);
    let chain = |marker: &str| {
        vec![
            spec("n1", "normalize", json!({}), &["sample:S1"]),
            spec("n2", "normalize", json!({"method": "linear", "cofactor": 2.0}), &["stage:n1"]),
            spec("n3", "gate", json!({"marker": marker, "threshold": 0.5}), &["stage:n2"]),
            spec("n4", "normalize", json!({"method": "log"}), &["stage:n3"]),
        ]
    };
    let exp = experiment(&engine, &chain("CD19"));

    let failed = engine.run_experiment(&exp).unwrap();
    assert_eq!(failed.run.status, RunStatus::Failed);
    assert_eq!(failed.stage("n3").unwrap().status, StageStatus::Failed);
    assert_eq!(failed.stage("n4").unwrap().status, StageStatus::Skipped);
    for node in ["n1", "n2"] {
        let key = failed.stage(node).unwrap().artifact_key.as_ref().unwrap();
        assert!(engine.get_artifact(key).is_ok(), "{node} stays retrievable");
    }

    engine.define_pipeline(&exp, &chain("CD3")).unwrap();
    let fixed = engine.run_experiment(&exp).unwrap();
    assert_eq!(fixed.run.status, RunStatus::Succeeded);
    assert_eq!(fixed.stage("n1").unwrap().status, StageStatus::Cached);
    assert_eq!(fixed.stage("n2").unwrap().status, StageStatus::Cached);
    assert_eq!(fixed.stage("n3").unwrap().status, StageStatus::Computed);
    assert_eq!(fixed.stage("n4").unwrap().status, StageStatus::Computed);
}

#[test]
fn panicking_stages_fail_without_unwinding() {
    let mut registry = default_registry().unwrap();
    registry
        .register_fn(passthrough_definition("fragile"), |_, _, _| {
            panic!("index out of bounds in compensation matrix")
        })
        .unwrap();
    let engine = engine(registry, 1);
    let exp = experiment(&engine, &[spec("f", "fragile", json!({}), &["sample:S1"])]);

    let provenance = engine.run_experiment(&exp).unwrap();
    let record = provenance.stage("f").unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("compensation matrix"));
}

/// Stage-record writes fail for good once the first node completes.
#[derive(Default)]
struct LosingStageRecords {
    inner: MemoryDocumentStore,
    gone: AtomicBool,
}

impl DocumentStore for LosingStageRecords {
    fn put(&self, collection: Collection, id: &str, document: &Value) -> Result<(), PersistenceError> {
        if collection == Collection::RunStages
            && (self.gone.load(Ordering::SeqCst) || document["status"] == "COMPUTED")
        {
            self.gone.store(true, Ordering::SeqCst);
            return Err(PersistenceError::Unavailable("store went away".into()));
        }
        self.inner.put(collection, id, document)
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, PersistenceError> {
        self.inner.get(collection, id)
    }

    fn list(&self, collection: Collection) -> Result<Vec<Value>, PersistenceError> {
        self.inner.list(collection)
    }
}

#[test]
fn store_outage_mid_run_still_closes_the_run() {
    let blobs = Arc::new(MemoryBlobStore::default());
    let store = StoreHandle::new(Arc::new(LosingStageRecords::default()), blobs)
        .with_retry(fast_retry(2));
    let engine = Engine::new(
        default_registry().unwrap(),
        store,
        WorkerPlan::new(ParallelismPolicy::Serial, None),
    );
    let exp = experiment(&engine, &linear_pipeline(2));

    let err = engine.run_experiment(&exp).unwrap_err();
    assert!(
        matches!(err, EngineError::Persistence(PersistenceError::Unavailable(_))),
        "unexpected error: {err}"
    );

    let runs = engine.experiments().list_runs(&exp).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].finished_at.is_some());
    assert_eq!(engine.metrics().snapshot().stages["normalize"].computed, 1);
}

#[test]
fn non_finite_stage_output_fails_the_node() {
    let mut registry = default_registry().unwrap();
    registry
        .register_fn(passthrough_definition("ratio"), |inputs, _, _| {
            let mut table = inputs.table("data")?.clone();
            for row in &mut table.rows {
                let zero = row[0] - row[0];
                row[0] = zero / zero;
            }
            Ok(Payload::Table(table))
        })
        .unwrap();
    let engine = engine(registry, 1);
    let exp = experiment(
        &engine,
        &[
            spec("r", "ratio", json!({}), &["sample:S1"]),
            spec("after", "normalize", json!({}), &["stage:r"]),
        ],
    );

    for _ in 0..2 {
        let provenance = engine.run_experiment(&exp).unwrap();
        let record = provenance.stage("r").unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("not finite"), "{:?}", record.error);
        let key = record.artifact_key.clone().unwrap();
        assert!(!engine.artifacts().contains(&key).unwrap(), "nothing is committed");
        assert_eq!(provenance.skipped, vec!["after"]);
    }
}

#[test]
fn samples_with_non_finite_values_are_refused() {
    let engine = engine(default_registry().unwrap(), 1);
    let created = engine.create_experiment("exp", "tester").unwrap();
    let mut bad = sample("S1", 0.0);
    bad.table.rows[3][1] = f64::INFINITY;

    let err = engine.register_sample(&created.id, bad).unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::InvalidPayload(PayloadError::NonFinite { row: 3, .. })
        ),
        "unexpected error: {err}"
    );
    let stored = engine.experiments().get_experiment(&created.id).unwrap();
    assert!(stored.samples.is_empty());
}

#[test]
fn configured_stage_overrides_reach_the_run() {
    let temp = tempfile::tempdir().unwrap();
    let config_path = temp.path().join("engine.yaml");
    fs::write(
        &config_path,
        format!(
            "store_root: '{}'\nstages:\n  remote:\n    max_attempts: 4\n  slow:\n    timeout_ms: 50\n  normalize:\n    max_attempts: 3\n",
            temp.path().join("store").display()
        ),
    )
    .unwrap();
    let config = EngineConfig::load(&config_path).unwrap();

    let mut registry = default_registry().unwrap();
    registry
        .register_fn(
            passthrough_definition("remote").retryable(fast_retry(2)),
            |_, _, _| Err(StageFailure::transient("service busy")),
        )
        .unwrap();
    registry
        .register_fn(passthrough_definition("slow"), |inputs, _, ctx| {
            for _ in 0..500 {
                ctx.checkpoint()?;
                thread::sleep(Duration::from_millis(10));
            }
            Ok(Payload::Table(inputs.table("data")?.clone()))
        })
        .unwrap();
    let engine = Engine::from_config(&config, registry).unwrap();
    let normalize = engine.registry().latest("normalize").unwrap();
    assert_eq!(normalize.definition.retry.max_attempts, 1, "not retryable, left alone");

    let exp = experiment(
        &engine,
        &[
            spec("r", "remote", json!({}), &["sample:S1"]),
            spec("s", "slow", json!({}), &["sample:S1"]),
        ],
    );
    let provenance = engine.run_experiment(&exp).unwrap();

    let remote = provenance.stage("r").unwrap();
    assert_eq!(remote.status, StageStatus::Failed);
    assert_eq!(remote.attempts, 4);
    assert!(remote.decisions.last().unwrap().contains("retry budget exhausted"));

    let slow = provenance.stage("s").unwrap();
    assert_eq!(slow.status, StageStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}
