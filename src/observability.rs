use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::run::RunStatus;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub nodes_skipped: u64,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    /// Stage implementation invocations, retries included.
    pub calls: u64,
    pub computed: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub retries: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared, cheaply cloneable counters for one engine instance.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    fn with_stage(&self, stage: &str, update: impl FnOnce(&mut StageMetrics)) {
        if let Ok(mut guard) = self.inner.lock() {
            update(guard.stages.entry(stage.to_string()).or_default());
        }
    }

    pub fn record_cache_hit(&self, stage: &str) {
        self.with_stage(stage, |m| m.cache_hits += 1);
    }

    pub fn record_computed(&self, stage: &str) {
        self.with_stage(stage, |m| m.computed += 1);
    }

    pub fn record_failure(&self, stage: &str) {
        self.with_stage(stage, |m| m.failures += 1);
    }

    pub fn record_retry(&self, stage: &str) {
        self.with_stage(stage, |m| m.retries += 1);
    }

    pub fn record_skipped(&self, count: usize) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.nodes_skipped += count as u64;
        }
    }

    pub fn record_run(&self, status: RunStatus, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                RunStatus::Succeeded => guard.runs_succeeded += 1,
                RunStatus::Failed => guard.runs_failed += 1,
                RunStatus::Pending | RunStatus::Running => {}
            }
            guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Counts one implementation call and its wall-clock time when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        nodes_skipped = snapshot.nodes_skipped,
        total_duration_ms = snapshot.total_duration_ms,
        "Engine metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            computed = metrics.computed,
            cache_hits = metrics.cache_hits,
            failures = metrics.failures,
            retries = metrics.retries,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

fn push_help(output: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        push_help(&mut output, "cytoflow_runs_total", "counter", "Finished runs by outcome");
        let _ = writeln!(output, "cytoflow_runs_total{{status=\"succeeded\"}} {}", self.runs_succeeded);
        let _ = writeln!(output, "cytoflow_runs_total{{status=\"failed\"}} {}", self.runs_failed);
        push_help(
            &mut output,
            "cytoflow_nodes_skipped_total",
            "counter",
            "Stage instances skipped after an upstream failure or abort",
        );
        let _ = writeln!(output, "cytoflow_nodes_skipped_total {}", self.nodes_skipped);

        let per_stage: [(&str, &str, &str, fn(&StageMetrics) -> String); 7] = [
            ("cytoflow_stage_calls_total", "counter", "Stage implementation invocations", |m| m.calls.to_string()),
            ("cytoflow_stage_computed_total", "counter", "Artifacts computed", |m| m.computed.to_string()),
            ("cytoflow_stage_cache_hits_total", "counter", "Artifacts reused from the store", |m| m.cache_hits.to_string()),
            ("cytoflow_stage_failures_total", "counter", "Terminal stage failures", |m| m.failures.to_string()),
            ("cytoflow_stage_retries_total", "counter", "Retried stage attempts", |m| m.retries.to_string()),
            ("cytoflow_stage_duration_seconds_total", "counter", "Accumulated stage duration in seconds", |m| format!("{:.6}", m.total_duration_ms / 1_000.0)),
            ("cytoflow_stage_duration_seconds_max", "gauge", "Maximum stage duration in seconds", |m| format!("{:.6}", m.max_duration_ms / 1_000.0)),
        ];
        for (name, kind, help, value) in per_stage {
            push_help(&mut output, name, kind, help);
            for (stage, metrics) in &self.stages {
                let _ = writeln!(output, "{name}{{stage=\"{stage}\"}} {}", value(metrics));
            }
        }

        push_help(
            &mut output,
            "cytoflow_run_duration_seconds_total",
            "counter",
            "Accumulated run duration",
        );
        let _ = writeln!(
            output,
            "cytoflow_run_duration_seconds_total {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_output_names_every_stage() {
        let metrics = MetricsCollector::new();
        drop(metrics.start_stage("cluster"));
        metrics.record_computed("cluster");
        metrics.record_cache_hit("normalize");
        metrics.record_run(RunStatus::Succeeded, Duration::from_millis(1500));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages["cluster"].calls, 1);
        assert_eq!(snapshot.stages["normalize"].cache_hits, 1);

        let text = snapshot.to_prometheus();
        assert!(text.contains("cytoflow_runs_total{status=\"succeeded\"} 1"));
        assert!(text.contains("cytoflow_stage_computed_total{stage=\"cluster\"} 1"));
        assert!(text.contains("cytoflow_stage_cache_hits_total{stage=\"normalize\"} 1"));
        assert!(text.contains("cytoflow_run_duration_seconds_total 1.500000"));
    }
}
