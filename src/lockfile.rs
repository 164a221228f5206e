use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::artifact::ArtifactKey;
use crate::graph::{PipelineGraph, SampleRef};
use crate::hashing::hash_value;
use crate::ingest::load_sample;
use crate::manifest::Manifest;
use crate::params::ResolvedParams;
use crate::registry::StageRegistry;

/// Pinned, fully keyed form of a manifest. Two lockfiles with the same keys
/// describe the same computations.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub manifest_version: u32,
    pub experiment: String,
    pub generated_at: DateTime<Utc>,
    pub samples: Vec<SampleLock>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SampleLock {
    pub id: String,
    pub path: String,
    pub content_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageLock {
    pub id: String,
    pub stage: String,
    pub version: u32,
    pub params_hash: String,
    pub artifact_key: ArtifactKey,
}

pub fn build_lock(manifest: &Manifest, base: &Path, registry: &StageRegistry) -> Result<PipelineLock> {
    let mut samples = Vec::new();
    for (path, _) in manifest.expand_samples(base)? {
        let sample = load_sample(&path)?;
        samples.push(SampleLock {
            id: sample.id,
            path: path.to_string_lossy().to_string(),
            content_hash: sample.content_hash,
        });
    }

    let refs: Vec<SampleRef> = samples
        .iter()
        .map(|s| SampleRef {
            id: s.id.clone(),
            content_hash: s.content_hash.clone(),
        })
        .collect();
    let graph = PipelineGraph::build(&manifest.pipeline, &refs, registry)
        .context("Manifest pipeline is invalid")?;
    let keys = graph.compute_keys();

    let stages = graph
        .nodes()
        .iter()
        .zip(keys)
        .map(|(node, key)| StageLock {
            id: node.id.clone(),
            stage: node.definition.name.clone(),
            version: node.definition.version,
            params_hash: hash_params(&node.definition.name, &node.params),
            artifact_key: key,
        })
        .collect();

    Ok(PipelineLock {
        manifest_version: manifest.version,
        experiment: manifest.experiment.clone(),
        generated_at: Utc::now(),
        samples,
        stages,
    })
}

pub fn generate_lock(
    manifest: &Manifest,
    base: &Path,
    registry: &StageRegistry,
    path: &Path,
) -> Result<PipelineLock> {
    let lock = build_lock(manifest, base, registry)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(lock)
}

fn hash_params(stage: &str, params: &ResolvedParams) -> String {
    let params: Map<String, Value> = params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    hash_value(&json!({ "stage": stage, "params": params }))
}
