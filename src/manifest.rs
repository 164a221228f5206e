use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::experiment::NewSample;
use crate::graph::StageSpec;
use crate::ingest::load_sample;

/// An experiment described as YAML: who owns it, which sample files feed it
/// and the pipeline to run over them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub experiment: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub samples: Vec<SampleSource>,
    pub pipeline: Vec<StageSpec>,
}

fn default_owner() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSource {
    /// Glob pattern, relative to the manifest's directory unless absolute.
    pub path: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub acquired_on: Option<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
        let manifest: Manifest = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest YAML: {}", path.display()))?;
        Ok(manifest)
    }

    /// Expand every sample pattern relative to `base`. Each pattern must
    /// match at least one file.
    pub fn expand_samples(&self, base: &Path) -> Result<Vec<(PathBuf, &SampleSource)>> {
        let mut resolved = Vec::new();
        for source in &self.samples {
            let pattern = if Path::new(&source.path).is_absolute() {
                source.path.clone()
            } else {
                base.join(&source.path).to_string_lossy().to_string()
            };
            let matches =
                glob(&pattern).with_context(|| format!("Invalid glob pattern: {}", source.path))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if path.is_file() {
                    resolved.push((path, source));
                    found = true;
                }
            }
            if !found {
                bail!("No sample files matched pattern: {}", source.path);
            }
        }
        Ok(resolved)
    }

    /// Hash and parse every sample file, attaching the acquisition metadata
    /// declared next to its pattern.
    pub fn load_samples(&self, base: &Path) -> Result<Vec<NewSample>> {
        self.expand_samples(base)?
            .into_iter()
            .map(|(path, source)| {
                let mut sample = load_sample(&path)?;
                sample.subject_id = source.subject.clone();
                sample.acquired_on = source.acquired_on.clone();
                Ok(sample)
            })
            .collect()
    }
}

/// Directory relative sample patterns are resolved against.
pub fn manifest_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
