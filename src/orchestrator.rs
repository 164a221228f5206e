use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use tracing::{Span, error, info, info_span, warn};

use crate::artifact::{ArtifactKey, Payload};
use crate::artifact_store::{ArtifactStore, ComputeOutcome};
use crate::error::{EngineError, EngineResult};
use crate::executor::StageExecutor;
use crate::experiment::ExperimentRegistry;
use crate::graph::{InputRef, PipelineGraph};
use crate::observability::MetricsCollector;
use crate::registry::{CancelToken, StageInputs, StageRegistry};
use crate::run::{Run, RunProvenance, RunStageRecord, RunStatus, StageStatus};

const ABORTED: &str = "run aborted";
const ABORTED_INTEGRITY: &str = "run aborted: data integrity violation";
const ABORTED_PERSISTENCE: &str = "run aborted: store unavailable";

/// What a worker reports back for one node.
struct NodeReport {
    idx: usize,
    result: EngineResult<ComputeOutcome>,
    duration_ms: u64,
    attempts: u32,
    decisions: Vec<String>,
}

/// Walks a Run's graph in dependency order, reusing cached artifacts and
/// dispatching misses to a bounded pool of workers.
pub struct RunOrchestrator<'a> {
    registry: &'a StageRegistry,
    experiments: &'a ExperimentRegistry,
    artifacts: &'a ArtifactStore,
    executor: &'a StageExecutor,
    metrics: MetricsCollector,
    workers: usize,
    cancel: CancelToken,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(
        registry: &'a StageRegistry,
        experiments: &'a ExperimentRegistry,
        artifacts: &'a ArtifactStore,
        executor: &'a StageExecutor,
    ) -> Self {
        Self {
            registry,
            experiments,
            artifacts,
            executor,
            metrics: MetricsCollector::new(),
            workers: 1,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute a freshly started run from scratch.
    pub fn execute(&self, run_id: &str) -> EngineResult<RunProvenance> {
        let run = self.experiments.get_run(run_id)?;
        self.drive(run, false)
    }

    /// Re-enter a run, keeping every node whose recorded artifact is still
    /// valid and continuing from the first node that is not.
    pub fn resume(&self, run_id: &str) -> EngineResult<RunProvenance> {
        let run = self.experiments.get_run(run_id)?;
        self.drive(run, true)
    }

    fn drive(&self, mut run: Run, reuse: bool) -> EngineResult<RunProvenance> {
        let started = Instant::now();
        let experiment = self.experiments.get_experiment(&run.experiment_id)?;
        let definition = self
            .experiments
            .get_definition(&run.experiment_id, run.graph_version)?;

        let graph = match PipelineGraph::build(
            &definition.stage_instances,
            &experiment.sample_refs(),
            self.registry,
        ) {
            Ok(graph) => graph,
            Err(err) => {
                error!(run_id = %run.id, error = %err, "Run definition no longer validates");
                run.status = RunStatus::Failed;
                run.finished_at = Some(Utc::now());
                self.experiments.save_run(&run)?;
                return Err(err.into());
            }
        };
        let keys = graph.compute_keys();

        let span = info_span!(
            "run",
            run_id = %run.id,
            experiment_id = %run.experiment_id,
            graph_version = run.graph_version
        );
        let _entered = span.enter();

        run.status = RunStatus::Running;
        run.started_at.get_or_insert_with(Utc::now);
        run.finished_at = None;
        run.attempt += 1;
        self.experiments.save_run(&run)?;

        let mut abort: Option<EngineError> = None;
        let mut records = Vec::with_capacity(graph.len());
        for (node, key) in graph.nodes().iter().zip(&keys) {
            let mut reusable = None;
            if reuse && abort.is_none() {
                match self.reusable_record(&run.id, &node.id, key) {
                    Ok(found) => reusable = found,
                    Err(err) => abort = Some(err),
                }
            }
            let record = match reusable {
                Some(record) => {
                    info!(node = %node.id, key = %key.short(), "Keeping completed node from earlier attempt");
                    record
                }
                None => RunStageRecord::pending(&run.id, &node.id, key),
            };
            if abort.is_none() {
                self.persist(&record, &mut abort);
            }
            records.push(record);
        }

        if abort.is_none() {
            abort = self.schedule(&graph, &keys, &mut records, &span);
        }

        let skipped_reason = match &abort {
            Some(EngineError::DataIntegrity(_)) => ABORTED_INTEGRITY,
            Some(EngineError::Persistence(_)) => ABORTED_PERSISTENCE,
            _ => ABORTED,
        };
        let mut late_skips = 0;
        for record in records.iter_mut() {
            if matches!(record.status, StageStatus::Pending | StageStatus::Running) {
                record.status = StageStatus::Skipped;
                record.skip_reason = Some(skipped_reason.to_string());
                self.persist(record, &mut abort);
                late_skips += 1;
            }
        }
        self.metrics.record_skipped(late_skips);

        run.status = if abort.is_none() && records.iter().all(|r| r.status.is_complete()) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        run.finished_at = Some(Utc::now());
        if let Err(err) = self.experiments.save_run(&run) {
            error!(error = %err, "Failed to record run outcome");
            abort.get_or_insert(err);
        }
        self.metrics.record_run(run.status, started.elapsed());

        if let Some(err) = abort {
            error!(status = %run.status, error = %err, "Run aborted");
            return Err(err);
        }

        let provenance = self.experiments.get_run_provenance(&run.id)?;
        match &provenance.first_failure {
            Some(failure) => error!(
                status = %run.status,
                first_failure = %failure.stage_instance_id,
                error = %failure.error,
                skipped = ?provenance.skipped,
                "Run finished"
            ),
            None if run.status == RunStatus::Failed => {
                warn!(status = %run.status, skipped = ?provenance.skipped, "Run finished")
            }
            None => info!(
                status = %run.status,
                cached = provenance.count(StageStatus::Cached),
                computed = provenance.count(StageStatus::Computed),
                "Run finished"
            ),
        }
        Ok(provenance)
    }

    /// Write a stage record. A store that stays unavailable past its retry
    /// budget aborts the run; later failures keep the first error.
    fn persist(&self, record: &RunStageRecord, abort: &mut Option<EngineError>) {
        if let Err(err) = self.experiments.record_stage(record) {
            error!(node = %record.stage_instance_id, error = %err, "Failed to record stage status");
            abort.get_or_insert(err);
        }
    }

    fn reusable_record(
        &self,
        run_id: &str,
        node: &str,
        key: &ArtifactKey,
    ) -> EngineResult<Option<RunStageRecord>> {
        let Some(record) = self.experiments.stage_record(run_id, node)? else {
            return Ok(None);
        };
        let same_key = record.artifact_key.as_ref() == Some(key);
        if record.status.is_complete() && same_key && self.artifacts.contains(key)? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Dispatch ready nodes until nothing is ready or in flight. Returns the
    /// error that aborted the run, if any. After an abort no new node is
    /// dispatched but in-flight nodes are drained.
    fn schedule(
        &self,
        graph: &PipelineGraph,
        keys: &[ArtifactKey],
        records: &mut [RunStageRecord],
        span: &Span,
    ) -> Option<EngineError> {
        let payloads: Mutex<HashMap<usize, Arc<Payload>>> = Mutex::new(HashMap::new());
        let upstream: Vec<Vec<usize>> = (0..graph.len()).map(|i| graph.upstream_of(i)).collect();

        let is_ready = |idx: usize, records: &[RunStageRecord]| {
            records[idx].status == StageStatus::Pending
                && upstream[idx].iter().all(|&up| records[up].status.is_complete())
        };

        let (job_tx, job_rx) = mpsc::channel::<usize>();
        let (report_tx, report_rx) = mpsc::channel::<NodeReport>();
        let job_rx = Mutex::new(job_rx);

        thread::scope(|scope| {
            for _ in 0..self.workers.min(graph.len()) {
                let report_tx = report_tx.clone();
                let job_rx = &job_rx;
                let payloads = &payloads;
                scope.spawn(move || {
                    loop {
                        let next = job_rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                        let Ok(idx) = next else { break };
                        let report = self.run_node(graph, keys, idx, payloads, span);
                        if report_tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(report_tx);

            let mut ready: BTreeSet<usize> =
                (0..graph.len()).filter(|&i| is_ready(i, records)).collect();
            let mut in_flight = 0usize;
            let mut abort: Option<EngineError> = None;

            loop {
                let halted = abort.is_some() || self.cancel.is_cancelled();
                while !halted && in_flight < self.workers {
                    let Some(idx) = ready.pop_first() else { break };
                    records[idx].status = StageStatus::Running;
                    if let Err(err) = self.experiments.record_stage(&records[idx]) {
                        error!(node = %graph.nodes()[idx].id, error = %err, "Failed to record stage status");
                        records[idx].status = StageStatus::Pending;
                        abort.get_or_insert(err);
                        break;
                    }
                    if job_tx.send(idx).is_err() {
                        records[idx].status = StageStatus::Pending;
                        break;
                    }
                    in_flight += 1;
                }
                if in_flight == 0 {
                    break;
                }

                let Ok(report) = report_rx.recv() else { break };
                in_flight -= 1;
                let idx = report.idx;
                let node = &graph.nodes()[idx];
                let record = &mut records[idx];
                record.duration_ms = report.duration_ms;
                record.attempts = report.attempts;
                record.decisions = report.decisions;

                match report.result {
                    Ok(outcome) => {
                        let cache_hit = outcome != ComputeOutcome::Computed;
                        record.status = if cache_hit {
                            StageStatus::Cached
                        } else {
                            StageStatus::Computed
                        };
                        record.cache_hit = cache_hit;
                        self.persist(record, &mut abort);
                        for dependent in graph.downstream_of(idx) {
                            if upstream[dependent].contains(&idx) && is_ready(dependent, records) {
                                ready.insert(dependent);
                            }
                        }
                    }
                    Err(err) => {
                        record.status = StageStatus::Failed;
                        record.error = Some(err.to_string());
                        self.metrics.record_failure(&node.definition.name);
                        self.persist(record, &mut abort);

                        let reason = format!("upstream node '{}' failed", node.id);
                        let mut skipped = 0;
                        for dependent in graph.downstream_of(idx) {
                            if records[dependent].status == StageStatus::Pending {
                                records[dependent].status = StageStatus::Skipped;
                                records[dependent].skip_reason = Some(reason.clone());
                                self.persist(&records[dependent], &mut abort);
                                ready.remove(&dependent);
                                skipped += 1;
                            }
                        }
                        self.metrics.record_skipped(skipped);
                        if skipped > 0 {
                            warn!(node = %node.id, skipped, "Skipping downstream nodes");
                        }

                        if let EngineError::DataIntegrity(_) = &err {
                            error!(node = %node.id, error = %err, "Aborting run after data integrity violation");
                            abort.get_or_insert(err);
                        }
                    }
                }
            }
            drop(job_tx);

            if abort.is_none() && self.cancel.is_cancelled() {
                warn!("Run cancelled; remaining nodes will be skipped");
            }
            abort
        })
    }

    fn run_node(
        &self,
        graph: &PipelineGraph,
        keys: &[ArtifactKey],
        idx: usize,
        payloads: &Mutex<HashMap<usize, Arc<Payload>>>,
        parent: &Span,
    ) -> NodeReport {
        let node = &graph.nodes()[idx];
        let key = &keys[idx];
        let definition = &node.definition;
        let span = info_span!(
            parent: parent,
            "stage",
            node = %node.id,
            stage = %definition.name,
            version = definition.version,
            key = %key.short()
        );
        let _entered = span.enter();

        let started = Instant::now();
        let mut attempts = 0u32;
        let mut decisions = Vec::new();

        let result = self.artifacts.get_or_compute(key, || {
            let inputs = self.load_inputs(graph, keys, idx, payloads)?;
            let max_attempts = if definition.retryable {
                definition.retry.max_attempts.max(1)
            } else {
                1
            };
            loop {
                attempts += 1;
                let _timer = self.metrics.start_stage(&definition.name);
                match self.executor.execute(node, key, inputs.clone(), &self.cancel) {
                    Ok(artifact) => return Ok(artifact),
                    Err(err) => {
                        let retry = definition.retryable
                            && err.is_transient()
                            && attempts < max_attempts
                            && !self.cancel.is_cancelled();
                        if retry {
                            let delay = definition.retry.delay(attempts);
                            decisions.push(format!(
                                "attempt {attempts}/{max_attempts} failed transiently ({}); retrying after {} ms",
                                err.cause,
                                delay.as_millis()
                            ));
                            warn!(attempt = attempts, max_attempts, delay_ms = delay.as_millis() as u64, error = %err.cause, "Retrying stage");
                            self.metrics.record_retry(&definition.name);
                            thread::sleep(delay);
                            continue;
                        }
                        let why = if !definition.retryable {
                            "stage is not retryable"
                        } else if !err.is_transient() {
                            "failure is not transient"
                        } else if self.cancel.is_cancelled() {
                            "run was cancelled"
                        } else {
                            "retry budget exhausted"
                        };
                        decisions.push(format!(
                            "attempt {attempts}/{max_attempts} failed ({}); not retrying: {why}",
                            err.cause
                        ));
                        return Err(err.into());
                    }
                }
            }
        });

        let result = result.map(|(artifact, outcome)| {
            match outcome {
                ComputeOutcome::Computed => {
                    self.metrics.record_computed(&definition.name);
                    info!(size_bytes = artifact.metadata.size_bytes, "Computed artifact");
                }
                ComputeOutcome::Cached | ComputeOutcome::Joined => {
                    self.metrics.record_cache_hit(&definition.name);
                    info!(joined = (outcome == ComputeOutcome::Joined), "Reusing cached artifact");
                }
            }
            payloads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(idx, Arc::new(artifact.payload));
            outcome
        });
        if let Err(err) = &result {
            error!(error = %err, "Stage failed");
        }

        NodeReport {
            idx,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            decisions,
        }
    }

    fn load_inputs(
        &self,
        graph: &PipelineGraph,
        keys: &[ArtifactKey],
        idx: usize,
        payloads: &Mutex<HashMap<usize, Arc<Payload>>>,
    ) -> EngineResult<StageInputs> {
        let node = &graph.nodes()[idx];
        let mut entries = Vec::with_capacity(node.inputs.len());
        for (slot, input) in node.definition.inputs.iter().zip(&node.inputs) {
            let payload = match input {
                InputRef::Sample(id) => {
                    let hash = graph
                        .sample_hash(id)
                        .ok_or_else(|| EngineError::not_found("sample", id))?;
                    Arc::new(self.experiments.load_sample_payload(hash)?)
                }
                InputRef::Stage(id) => {
                    let up = graph
                        .node(id)
                        .map(|n| n.index)
                        .ok_or_else(|| EngineError::not_found("stage node", id))?;
                    let cached = payloads
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&up)
                        .cloned();
                    match cached {
                        Some(payload) => payload,
                        None => {
                            let payload = Arc::new(self.artifacts.get(&keys[up])?.payload);
                            payloads
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(up, Arc::clone(&payload));
                            payload
                        }
                    }
                }
            };
            entries.push((slot.name.clone(), payload));
        }
        Ok(StageInputs::new(entries))
    }
}
