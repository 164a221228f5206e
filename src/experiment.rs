use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::artifact::{Payload, Table};
use crate::error::{EngineError, EngineResult, PersistenceError};
use crate::graph::{PipelineGraph, SampleRef, StageSpec};
use crate::registry::StageRegistry;
use crate::run::{FirstFailure, Run, RunProvenance, RunStageRecord, RunStatus, StageStatus};
use crate::store::{Collection, StoreHandle};

/// Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub id: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub markers: Vec<String>,
    pub n_events: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_on: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Sample {
    pub fn blob_locator(content_hash: &str) -> String {
        format!("samples/{content_hash}")
    }
}

/// A parsed sample ready for registration. Instrument parsing happens before
/// this point.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub id: String,
    pub content_hash: String,
    pub table: Table,
    pub source: Option<String>,
    pub subject_id: Option<String>,
    pub acquired_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub current_graph_version: Option<u32>,
}

impl Experiment {
    pub fn sample_refs(&self) -> Vec<SampleRef> {
        self.samples
            .iter()
            .map(|s| SampleRef {
                id: s.id.clone(),
                content_hash: s.content_hash.clone(),
            })
            .collect()
    }

    pub fn sample(&self, id: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.id == id)
    }
}

/// Stored once per version and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub id: String,
    pub experiment_id: String,
    pub version: u32,
    pub stage_instances: Vec<StageSpec>,
    pub created_at: DateTime<Utc>,
}

impl PipelineDefinition {
    pub fn document_id(experiment_id: &str, version: u32) -> String {
        format!("{experiment_id}__v{version}")
    }
}

/// Durable record of experiments, their pipeline definitions and their runs.
pub struct ExperimentRegistry {
    store: StoreHandle,
    // Serialises read-modify-write cycles on experiment documents.
    writes: Mutex<()>,
}

impl ExperimentRegistry {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            writes: Mutex::new(()),
        }
    }

    pub fn create_experiment(&self, name: &str, owner: &str) -> EngineResult<Experiment> {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if self.list_experiments()?.iter().any(|e| e.name == name) {
            return Err(EngineError::Conflict(format!(
                "experiment '{name}' already exists"
            )));
        }
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
            created_at: Utc::now(),
            samples: Vec::new(),
            current_graph_version: None,
        };
        self.store
            .put_doc(Collection::Experiments, &experiment.id, &experiment)?;
        info!(experiment = %experiment.name, id = %experiment.id, owner, "Created experiment");
        Ok(experiment)
    }

    pub fn list_experiments(&self) -> EngineResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self.store.list_docs(Collection::Experiments)?;
        experiments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(experiments)
    }

    pub fn get_experiment(&self, id: &str) -> EngineResult<Experiment> {
        self.store
            .get_doc(Collection::Experiments, id)?
            .ok_or_else(|| EngineError::not_found("experiment", id))
    }

    /// Look an experiment up by name first, then by id.
    pub fn find_experiment(&self, name_or_id: &str) -> EngineResult<Experiment> {
        self.list_experiments()?
            .into_iter()
            .find(|e| e.name == name_or_id || e.id == name_or_id)
            .ok_or_else(|| EngineError::not_found("experiment", name_or_id))
    }

    /// Register a sample with an experiment. Re-registering the same id with
    /// the same content is a no-op; with different content it is a conflict.
    pub fn register_sample(&self, experiment_id: &str, sample: NewSample) -> EngineResult<Sample> {
        let bytes = Payload::Table(sample.table.clone()).canonical_bytes()?;
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut experiment = self.get_experiment(experiment_id)?;
        if let Some(existing) = experiment.sample(&sample.id) {
            if existing.content_hash == sample.content_hash {
                return Ok(existing.clone());
            }
            return Err(EngineError::Conflict(format!(
                "sample '{}' is already registered with content {}",
                sample.id, existing.content_hash
            )));
        }

        self.store
            .write_blob(&Sample::blob_locator(&sample.content_hash), &bytes)?;

        let record = Sample {
            id: sample.id,
            content_hash: sample.content_hash,
            source: sample.source,
            markers: sample.table.columns.clone(),
            n_events: sample.table.n_events(),
            subject_id: sample.subject_id,
            acquired_on: sample.acquired_on,
            registered_at: Utc::now(),
        };
        experiment.samples.push(record.clone());
        self.store
            .put_doc(Collection::Experiments, &experiment.id, &experiment)?;
        info!(experiment = %experiment.name, sample = %record.id, events = record.n_events, "Registered sample");
        Ok(record)
    }

    pub fn load_sample_payload(&self, content_hash: &str) -> EngineResult<Payload> {
        let locator = Sample::blob_locator(content_hash);
        let bytes = self
            .store
            .read_blob(&locator)?
            .ok_or_else(|| EngineError::not_found("sample payload", content_hash))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| PersistenceError::serialization(&locator, err).into())
    }

    /// Validate `specs` against the experiment's samples and write them as the
    /// next definition version. Earlier versions are left untouched.
    pub fn update_pipeline_definition(
        &self,
        experiment_id: &str,
        specs: &[StageSpec],
        registry: &StageRegistry,
    ) -> EngineResult<PipelineDefinition> {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut experiment = self.get_experiment(experiment_id)?;
        let graph = PipelineGraph::build(specs, &experiment.sample_refs(), registry)?;

        let version = experiment.current_graph_version.unwrap_or(0) + 1;
        let definition = PipelineDefinition {
            id: PipelineDefinition::document_id(&experiment.id, version),
            experiment_id: experiment.id.clone(),
            version,
            stage_instances: graph.pinned_specs(),
            created_at: Utc::now(),
        };
        self.store
            .put_doc(Collection::PipelineDefinitions, &definition.id, &definition)?;
        experiment.current_graph_version = Some(version);
        self.store
            .put_doc(Collection::Experiments, &experiment.id, &experiment)?;
        info!(experiment = %experiment.name, version, stages = specs.len(), "Stored pipeline definition");
        Ok(definition)
    }

    pub fn get_definition(&self, experiment_id: &str, version: u32) -> EngineResult<PipelineDefinition> {
        let id = PipelineDefinition::document_id(experiment_id, version);
        self.store
            .get_doc(Collection::PipelineDefinitions, &id)?
            .ok_or_else(|| EngineError::not_found("pipeline definition", id))
    }

    /// Create a PENDING run bound to the experiment's current definition.
    /// Definitions are immutable, so the version number is a complete
    /// snapshot.
    pub fn start_run(&self, experiment_id: &str) -> EngineResult<Run> {
        let experiment = self.get_experiment(experiment_id)?;
        let version = experiment.current_graph_version.ok_or_else(|| {
            EngineError::not_found("pipeline definition for experiment", &experiment.name)
        })?;
        let run = Run {
            id: Uuid::new_v4().to_string(),
            experiment_id: experiment.id.clone(),
            graph_version: version,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempt: 0,
        };
        self.save_run(&run)?;
        Ok(run)
    }

    pub fn save_run(&self, run: &Run) -> EngineResult<()> {
        Ok(self.store.put_doc(Collection::Runs, &run.id, run)?)
    }

    pub fn get_run(&self, run_id: &str) -> EngineResult<Run> {
        self.store
            .get_doc(Collection::Runs, run_id)?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    pub fn list_runs(&self, experiment_id: &str) -> EngineResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .store
            .list_docs::<Run>(Collection::Runs)?
            .into_iter()
            .filter(|run| run.experiment_id == experiment_id)
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    pub fn record_stage(&self, record: &RunStageRecord) -> EngineResult<()> {
        let id = RunStageRecord::document_id(&record.run_id, &record.stage_instance_id);
        Ok(self.store.put_doc(Collection::RunStages, &id, record)?)
    }

    pub fn stage_record(&self, run_id: &str, node: &str) -> EngineResult<Option<RunStageRecord>> {
        let id = RunStageRecord::document_id(run_id, node);
        Ok(self.store.get_doc(Collection::RunStages, &id)?)
    }

    /// The run, every stage record in declaration order, the first failure
    /// and the skipped nodes.
    pub fn get_run_provenance(&self, run_id: &str) -> EngineResult<RunProvenance> {
        let run = self.get_run(run_id)?;
        let definition = self.get_definition(&run.experiment_id, run.graph_version)?;

        let mut stages = Vec::with_capacity(definition.stage_instances.len());
        for spec in &definition.stage_instances {
            if let Some(record) = self.stage_record(run_id, &spec.id)? {
                stages.push(record);
            }
        }

        let first_failure = stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
            .map(|s| FirstFailure {
                stage_instance_id: s.stage_instance_id.clone(),
                error: s.error.clone().unwrap_or_default(),
            });
        let skipped = stages
            .iter()
            .filter(|s| s.status == StageStatus::Skipped)
            .map(|s| s.stage_instance_id.clone())
            .collect();

        Ok(RunProvenance {
            run,
            stages,
            first_failure,
            skipped,
        })
    }
}
