use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Cached,
    Computed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// The node's artifact is committed and usable downstream.
    pub fn is_complete(&self) -> bool {
        matches!(self, StageStatus::Cached | StageStatus::Computed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Running => "RUNNING",
            StageStatus::Cached => "CACHED",
            StageStatus::Computed => "COMPUTED",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "SKIPPED",
        })
    }
}

/// One execution attempt of a pipeline definition (`runs` collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub experiment_id: String,
    pub graph_version: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Incremented every time the run is resumed.
    #[serde(default)]
    pub attempt: u32,
}

/// Per-node provenance inside a Run (`runStages` collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStageRecord {
    pub run_id: String,
    pub stage_instance_id: String,
    pub status: StageStatus,
    pub artifact_key: Option<ArtifactKey>,
    pub cache_hit: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Retry and terminal-failure decisions, in the order they were taken.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<String>,
}

impl RunStageRecord {
    pub fn pending(run_id: &str, node: &str, key: &ArtifactKey) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage_instance_id: node.to_string(),
            status: StageStatus::Pending,
            artifact_key: Some(key.clone()),
            cache_hit: false,
            duration_ms: 0,
            attempts: 0,
            error: None,
            skip_reason: None,
            decisions: Vec::new(),
        }
    }

    pub fn document_id(run_id: &str, node: &str) -> String {
        format!("{run_id}__{node}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstFailure {
    pub stage_instance_id: String,
    pub error: String,
}

/// Everything needed to explain (and reproduce) a Run after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProvenance {
    pub run: Run,
    pub stages: Vec<RunStageRecord>,
    pub first_failure: Option<FirstFailure>,
    pub skipped: Vec<String>,
}

impl RunProvenance {
    pub fn stage(&self, node: &str) -> Option<&RunStageRecord> {
        self.stages.iter().find(|s| s.stage_instance_id == node)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    pub fn succeeded(&self) -> bool {
        self.run.status == RunStatus::Succeeded
    }
}
