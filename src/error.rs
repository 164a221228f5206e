use std::time::Duration;

use thiserror::Error;

use crate::artifact::{ArtifactKey, ArtifactType};
use crate::params::{ParamError, ResolvedParams};
use crate::registry::FailureKind;

/// Malformed pipeline definitions. Raised before anything executes and never
/// retried; every variant names the offending node where one exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Pipeline must contain at least one stage")]
    EmptyPipeline,
    #[error("Node id '{node}' is invalid: ids may only contain ASCII letters, digits, '-' and '_'")]
    InvalidNodeId { node: String },
    #[error("Node '{node}' is declared more than once")]
    DuplicateNode { node: String },
    #[error("Node '{node}' references unknown stage '{stage}'. Available stages: {available}")]
    UnknownStage {
        node: String,
        stage: String,
        available: String,
    },
    #[error("Node '{node}' references stage '{stage}' version {version}, known versions: {known:?}")]
    UnknownVersion {
        node: String,
        stage: String,
        version: u32,
        known: Vec<u32>,
    },
    #[error("Node '{node}' has invalid parameters: {source}")]
    InvalidParameter { node: String, source: ParamError },
    #[error("Node '{node}' is wired to unknown stage node '{input}'")]
    UnknownInput { node: String, input: String },
    #[error("Node '{node}' is wired to unknown sample '{sample}'")]
    UnknownSample { node: String, sample: String },
    #[error("Node '{node}' participates in a dependency cycle: {}", .path.join(" -> "))]
    Cycle { node: String, path: Vec<String> },
    #[error("Node '{node}' expects {expected} input(s) but {found} were wired")]
    ArityMismatch {
        node: String,
        expected: usize,
        found: usize,
    },
    #[error("Node '{node}' input '{slot}' expects {expected} but upstream produces {found}")]
    TypeMismatch {
        node: String,
        slot: String,
        expected: ArtifactType,
        found: ArtifactType,
    },
}

impl ValidationError {
    pub fn node(&self) -> Option<&str> {
        match self {
            ValidationError::EmptyPipeline => None,
            ValidationError::InvalidNodeId { node }
            | ValidationError::DuplicateNode { node }
            | ValidationError::UnknownStage { node, .. }
            | ValidationError::UnknownVersion { node, .. }
            | ValidationError::InvalidParameter { node, .. }
            | ValidationError::UnknownInput { node, .. }
            | ValidationError::UnknownSample { node, .. }
            | ValidationError::Cycle { node, .. }
            | ValidationError::ArityMismatch { node, .. }
            | ValidationError::TypeMismatch { node, .. } => Some(node),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Stage '{name}' version {version} is already registered")]
    Duplicate { name: String, version: u32 },
    #[error("Stage '{name}' is stochastic but its parameter schema has no 'seed'")]
    MissingSeed { name: String },
    #[error("Stage '{name}' declares parameter '{param}' more than once")]
    DuplicateParameter { name: String, param: String },
}

/// Payloads that cannot be stored without losing information.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("value for marker '{column}' at event {row} is not finite")]
    NonFinite { column: String, row: usize },
    #[error("event {row} has {found} values for {expected} markers")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("payload could not be encoded: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageErrorCause {
    #[error("{kind} failure: {message}")]
    Failed { kind: FailureKind, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("returned {found} but the definition declares {expected}")]
    OutputTypeMismatch {
        expected: ArtifactType,
        found: ArtifactType,
    },
    #[error("returned an invalid payload: {0}")]
    InvalidOutput(PayloadError),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Stage '{node}' ({stage}@v{version}) failed: {cause}")]
pub struct StageExecutionError {
    pub node: String,
    pub stage: String,
    pub version: u32,
    pub params: ResolvedParams,
    pub cause: StageErrorCause,
}

impl StageExecutionError {
    /// Only transient failures reported by the implementation itself qualify
    /// for a retry; timeouts, panics and type mismatches do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.cause,
            StageErrorCause::Failed {
                kind: FailureKind::Transient,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Data integrity violation for artifact {key}: stored content {stored} differs from {incoming}"
)]
pub struct DataIntegrityError {
    pub key: ArtifactKey,
    pub stored: String,
    pub incoming: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Failed to {op} '{target}': {message}")]
    Io {
        op: &'static str,
        target: String,
        message: String,
    },
    #[error("Failed to encode or decode '{target}': {message}")]
    Serialization { target: String, message: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn io(op: &'static str, target: impl Into<String>, err: impl ToString) -> Self {
        PersistenceError::Io {
            op,
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn serialization(target: impl Into<String>, err: impl ToString) -> Self {
        PersistenceError::Serialization {
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Encoding problems will not go away on their own.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PersistenceError::Serialization { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    StageExecution(#[from] StageExecutionError),
    #[error(transparent)]
    DataIntegrity(#[from] DataIntegrityError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error("Computation for artifact {0} was abandoned before completing")]
    Abandoned(ArtifactKey),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
