use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::Serialize;

use crate::graph::{InputRef, PipelineGraph, SampleRef};
use crate::manifest::Manifest;
use crate::params::SEED_PARAM;
use crate::registry::StageRegistry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check a manifest without touching the store. Sample files are located but
/// not hashed, so the graph is validated against their ids only.
pub fn validate_manifest(manifest: &Manifest, base: &Path, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != 1 {
        report
            .errors
            .push(format!("Unsupported manifest version: {}", manifest.version));
    }
    if manifest.experiment.trim().is_empty() {
        report.errors.push("Experiment name cannot be empty".into());
    }

    report.merge(validate_samples(manifest, base));
    let sample_ids = sample_ids(manifest, base);

    let refs: Vec<SampleRef> = sample_ids
        .iter()
        .map(|id| SampleRef {
            id: id.clone(),
            content_hash: String::new(),
        })
        .collect();
    if let Err(err) = PipelineGraph::build(&manifest.pipeline, &refs, registry) {
        report.errors.push(err.to_string());
    }

    report.merge(seed_warnings(manifest, registry));

    let consumed: HashSet<&str> = manifest
        .pipeline
        .iter()
        .flat_map(|spec| &spec.inputs)
        .filter_map(|input| match input {
            InputRef::Sample(id) => Some(id.as_str()),
            InputRef::Stage(_) => None,
        })
        .collect();
    for id in &sample_ids {
        if !consumed.contains(id.as_str()) {
            report
                .warnings
                .push(format!("Sample '{id}' is not consumed by any stage"));
        }
    }

    report
}

fn validate_samples(manifest: &Manifest, base: &Path) -> ValidationReport {
    let mut report = ValidationReport::default();
    if manifest.samples.is_empty() {
        report
            .errors
            .push("At least one sample pattern is required".into());
    }
    for (idx, source) in manifest.samples.iter().enumerate() {
        if source.path.trim().is_empty() {
            report
                .errors
                .push("Sample path patterns cannot be empty".into());
        } else if let Err(err) = glob::Pattern::new(&source.path) {
            report.errors.push(format!(
                "Sample pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                source.path,
                err
            ));
        }
    }
    if report.is_ok()
        && let Err(err) = manifest.expand_samples(base)
    {
        report.errors.push(err.to_string());
    }
    report
}

fn sample_ids(manifest: &Manifest, base: &Path) -> BTreeSet<String> {
    manifest
        .expand_samples(base)
        .map(|paths| {
            paths
                .into_iter()
                .filter_map(|(path, _)| path.file_stem().map(|s| s.to_string_lossy().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Stochastic stages fall back to the default seed when none is written
/// down; that is reproducible but easy to overlook.
fn seed_warnings(manifest: &Manifest, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    for spec in &manifest.pipeline {
        let stage = match spec.version {
            Some(version) => registry.get(&spec.stage, version),
            None => registry.latest(&spec.stage),
        };
        let Some(stage) = stage else { continue };
        if stage.definition.stochastic && !spec.params.contains_key(SEED_PARAM) {
            report.warnings.push(format!(
                "Stage '{}' ({}) is stochastic and has no explicit seed; the default seed will be used",
                spec.id,
                stage.definition.id()
            ));
        }
    }
    report
}
