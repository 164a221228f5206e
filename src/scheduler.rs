use std::num::NonZeroUsize;
use std::thread;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const WORKERS_ENV: &str = "CYTOFLOW_WORKERS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelismPolicy {
    /// One worker per available core unless a count is given.
    #[default]
    Auto,
    /// A single worker; nodes run one at a time in topological order.
    Serial,
}

/// Sizes the bounded worker pool the orchestrator dispatches ready nodes to.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    policy: ParallelismPolicy,
    workers: usize,
}

impl WorkerPlan {
    /// `requested` wins over `CYTOFLOW_WORKERS`, which wins over the core
    /// count. `Serial` always yields one worker.
    pub fn new(policy: ParallelismPolicy, requested: Option<usize>) -> Self {
        let workers = match policy {
            ParallelismPolicy::Serial => 1,
            ParallelismPolicy::Auto => requested
                .or_else(env_workers)
                .unwrap_or_else(available_cores)
                .max(1),
        };
        Self { policy, workers }
    }

    pub fn policy(&self) -> ParallelismPolicy {
        self.policy
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

fn env_workers() -> Option<usize> {
    std::env::var(WORKERS_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
}

fn available_cores() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
