pub mod artifact;
pub mod artifact_store;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod graph;
pub mod hashing;
pub mod ingest;
pub mod lockfile;
pub mod manifest;
pub mod observability;
pub mod orchestrator;
pub mod params;
pub mod registry;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod stages;
pub mod store;
pub mod validation;

pub use artifact::{Artifact, ArtifactKey, ArtifactType, Payload, Table};
pub use engine::{Engine, default_registry, open_engine};
pub use error::{EngineError, EngineResult};
pub use graph::{InputRef, PipelineGraph, StageSpec};
pub use registry::{StageDefinition, StageRegistry};
pub use run::{RunProvenance, RunStatus, StageStatus};
