#![allow(dead_code)]

use cytoflow_engine::engine::{Engine, default_registry};
use cytoflow_engine::experiment::NewSample;
use cytoflow_engine::hashing::hash_bytes;
use cytoflow_engine::scheduler::{ParallelismPolicy, WorkerPlan};
use cytoflow_engine::store::StoreHandle;
use cytoflow_engine::{InputRef, Payload, StageRegistry, StageSpec, Table};
use serde_json::Value;

/// Two well separated populations over three markers.
pub fn sample_table(offset: f64) -> Table {
    let mut rows = Vec::new();
    for i in 0..30 {
        let jitter = (i % 7) as f64 * 0.5;
        rows.push(vec![10.0 + jitter + offset, 200.0 - jitter, 5.0 + jitter]);
        rows.push(vec![300.0 - jitter + offset, 15.0 + jitter, 80.0 - jitter]);
    }
    Table::new(vec!["CD3".into(), "CD4".into(), "CD8".into()], rows)
}

pub fn sample(id: &str, offset: f64) -> NewSample {
    let table = sample_table(offset);
    NewSample {
        id: id.to_string(),
        content_hash: hash_bytes(&Payload::Table(table.clone()).canonical_bytes().unwrap()),
        table,
        source: None,
        subject_id: None,
        acquired_on: None,
    }
}

pub fn spec(id: &str, stage: &str, params: Value, inputs: &[&str]) -> StageSpec {
    StageSpec {
        id: id.to_string(),
        stage: stage.to_string(),
        version: None,
        params: params.as_object().cloned().unwrap_or_default(),
        inputs: inputs
            .iter()
            .map(|raw| InputRef::try_from(raw.to_string()).unwrap())
            .collect(),
    }
}

pub fn engine(registry: StageRegistry, workers: usize) -> Engine {
    Engine::new(
        registry,
        StoreHandle::in_memory(),
        WorkerPlan::new(ParallelismPolicy::Auto, Some(workers)),
    )
}

pub fn builtin_engine(workers: usize) -> Engine {
    engine(default_registry().unwrap(), workers)
}

/// Experiment with one registered sample `S1` and `specs` as its definition.
pub fn experiment(engine: &Engine, specs: &[StageSpec]) -> String {
    let experiment = engine.create_experiment("exp", "tester").unwrap();
    engine
        .register_sample(&experiment.id, sample("S1", 0.0))
        .unwrap();
    engine.define_pipeline(&experiment.id, specs).unwrap();
    experiment.id
}

/// normalize -> cluster -> summarize over `S1`.
pub fn linear_pipeline(k: i64) -> Vec<StageSpec> {
    vec![
        spec("norm", "normalize", serde_json::json!({"cofactor": 5.0}), &["sample:S1"]),
        spec("clust", "cluster", serde_json::json!({"k": k, "seed": 11}), &["stage:norm"]),
        spec("report", "summarize", serde_json::json!({}), &["stage:norm", "stage:clust"]),
    ]
}
