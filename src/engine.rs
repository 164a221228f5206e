use std::path::Path;

use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactKey};
use crate::artifact_store::ArtifactStore;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, RegistryError};
use crate::executor::StageExecutor;
use crate::experiment::{Experiment, ExperimentRegistry, NewSample, PipelineDefinition, Sample};
use crate::graph::StageSpec;
use crate::observability::MetricsCollector;
use crate::orchestrator::RunOrchestrator;
use crate::registry::{CancelToken, StageRegistry};
use crate::run::{Run, RunProvenance};
use crate::scheduler::WorkerPlan;
use crate::stages;
use crate::store::StoreHandle;

/// One engine instance: stage catalogue, experiment metadata, artifact
/// cache and the shared metrics they report into.
pub struct Engine {
    registry: StageRegistry,
    experiments: ExperimentRegistry,
    artifacts: ArtifactStore,
    executor: StageExecutor,
    metrics: MetricsCollector,
    plan: WorkerPlan,
}

impl Engine {
    pub fn new(registry: StageRegistry, store: StoreHandle, plan: WorkerPlan) -> Self {
        Self {
            registry,
            experiments: ExperimentRegistry::new(store.clone()),
            artifacts: ArtifactStore::new(store),
            executor: StageExecutor::new(),
            metrics: MetricsCollector::new(),
            plan,
        }
    }

    /// Volatile engine with the built-in stages; handy for tests and
    /// dry runs.
    pub fn in_memory() -> Result<Self, RegistryError> {
        Ok(Self::new(
            default_registry()?,
            StoreHandle::in_memory(),
            WorkerPlan::new(Default::default(), None),
        ))
    }

    /// Open the filesystem store named by `config` and apply its stage
    /// overrides to `registry`.
    pub fn from_config(config: &EngineConfig, mut registry: StageRegistry) -> EngineResult<Self> {
        for (stage, overrides) in &config.stages {
            registry.override_policy(stage, overrides.timeout(), overrides.max_attempts);
        }
        let store = StoreHandle::open(&config.store_root)?.with_retry(config.persistence_retry.clone());
        let plan = WorkerPlan::new(config.parallelism, config.workers);
        debug!(
            store = %config.store_root.display(),
            workers = plan.workers(),
            "Opened engine"
        );
        Ok(Self::new(registry, store, plan))
    }

    pub fn with_plan(mut self, plan: WorkerPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn experiments(&self) -> &ExperimentRegistry {
        &self.experiments
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn workers(&self) -> usize {
        self.plan.workers()
    }

    pub fn create_experiment(&self, name: &str, owner: &str) -> EngineResult<Experiment> {
        self.experiments.create_experiment(name, owner)
    }

    pub fn register_sample(&self, experiment_id: &str, sample: NewSample) -> EngineResult<Sample> {
        self.experiments.register_sample(experiment_id, sample)
    }

    pub fn define_pipeline(
        &self,
        experiment_id: &str,
        specs: &[StageSpec],
    ) -> EngineResult<PipelineDefinition> {
        self.experiments
            .update_pipeline_definition(experiment_id, specs, &self.registry)
    }

    fn orchestrator(&self, cancel: CancelToken) -> RunOrchestrator<'_> {
        RunOrchestrator::new(&self.registry, &self.experiments, &self.artifacts, &self.executor)
            .with_workers(self.plan.workers())
            .with_metrics(self.metrics.clone())
            .with_cancel(cancel)
    }

    /// Start and execute a run of the experiment's current definition.
    pub fn run_experiment(&self, experiment_id: &str) -> EngineResult<RunProvenance> {
        self.run_experiment_with_cancel(experiment_id, CancelToken::new())
    }

    pub fn run_experiment_with_cancel(
        &self,
        experiment_id: &str,
        cancel: CancelToken,
    ) -> EngineResult<RunProvenance> {
        let run = self.experiments.start_run(experiment_id)?;
        info!(run_id = %run.id, workers = self.plan.workers(), "Starting run");
        self.orchestrator(cancel).execute(&run.id)
    }

    pub fn resume_run(&self, run_id: &str) -> EngineResult<RunProvenance> {
        info!(run_id, "Resuming run");
        self.orchestrator(CancelToken::new()).resume(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> EngineResult<Run> {
        self.experiments.get_run(run_id)
    }

    pub fn get_run_provenance(&self, run_id: &str) -> EngineResult<RunProvenance> {
        self.experiments.get_run_provenance(run_id)
    }

    pub fn get_artifact(&self, key: &ArtifactKey) -> EngineResult<Artifact> {
        self.artifacts.get(key)
    }

    /// Artifact a completed node of `run_id` produced.
    pub fn node_artifact(&self, run_id: &str, node: &str) -> EngineResult<Artifact> {
        let record = self
            .experiments
            .stage_record(run_id, node)?
            .ok_or_else(|| EngineError::not_found("run stage", node))?;
        let key = record
            .artifact_key
            .ok_or_else(|| EngineError::not_found("artifact for node", node))?;
        self.artifacts.get(&key)
    }
}

/// Registry holding every built-in stage.
pub fn default_registry() -> Result<StageRegistry, RegistryError> {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry)?;
    Ok(registry)
}

/// Resolve configuration from an optional file plus an optional store
/// override and open the engine with the built-in stages.
pub fn open_engine(config_path: Option<&Path>, store: Option<&Path>) -> anyhow::Result<Engine> {
    let mut config = EngineConfig::resolve(config_path)?;
    if let Some(store) = store {
        config.store_root = store.to_path_buf();
    }
    let engine = Engine::from_config(&config, default_registry()?)?;
    Ok(engine)
}
