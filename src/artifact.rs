use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::PayloadError;
use crate::hashing::{hash_bytes, hash_value, to_canonical_json};
use crate::params::ResolvedParams;

pub const KEY_SCHEMA: &str = "cytoflow.artifact-key/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Table,
    Embedding,
    Labels,
    Model,
    Report,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactType::Table => "table",
            ArtifactType::Embedding => "embedding",
            ArtifactType::Labels => "labels",
            ArtifactType::Model => "model",
            ArtifactType::Report => "report",
        };
        f.write_str(name)
    }
}

/// Event-by-marker matrix. Rows are events, columns are markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        Self { columns, rows }
    }

    pub fn n_events(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// JSON has no encoding for NaN or infinities, and a ragged row has no
    /// marker to attach its extra values to; both are rejected up front.
    pub fn check(&self) -> Result<(), PayloadError> {
        for (row, values) in self.rows.iter().enumerate() {
            if values.len() != self.columns.len() {
                return Err(PayloadError::RaggedRow {
                    row,
                    expected: self.columns.len(),
                    found: values.len(),
                });
            }
            if let Some(col) = values.iter().position(|v| !v.is_finite()) {
                return Err(PayloadError::NonFinite {
                    column: self.columns[col].clone(),
                    row,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Table(Table),
    Embedding(Table),
    Labels(Vec<u32>),
    Model(Value),
    Report(Value),
}

impl Payload {
    pub fn artifact_type(&self) -> ArtifactType {
        match self {
            Payload::Table(_) => ArtifactType::Table,
            Payload::Embedding(_) => ArtifactType::Embedding,
            Payload::Labels(_) => ArtifactType::Labels,
            Payload::Model(_) => ArtifactType::Model,
            Payload::Report(_) => ArtifactType::Report,
        }
    }

    /// Canonical byte encoding; this is exactly what lands in the blob area.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        if let Some(table) = self.as_table() {
            table.check()?;
        }
        let value = serde_json::to_value(self).map_err(|err| PayloadError::Encode(err.to_string()))?;
        Ok(to_canonical_json(&value).into_bytes())
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Payload::Table(table) | Payload::Embedding(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_labels(&self) -> Option<&[u32]> {
        match self {
            Payload::Labels(labels) => Some(labels),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blob locator: two levels of fan-out keep directories small.
    pub fn locator(&self) -> String {
        let k = &self.0;
        if k.len() < 4 {
            return format!("artifacts/{k}");
        }
        format!("artifacts/{}/{}/{}", &k[..2], &k[2..4], k)
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One upstream contribution to a key: either a raw sample (by content hash)
/// or another stage's artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputFingerprint {
    Sample(String),
    Artifact(ArtifactKey),
}

impl InputFingerprint {
    fn to_value(&self) -> Value {
        match self {
            InputFingerprint::Sample(hash) => json!({ "sample": hash }),
            InputFingerprint::Artifact(key) => json!({ "artifact": key.as_str() }),
        }
    }
}

/// Pure function of its arguments: same stage, version, parameters and
/// ordered inputs give the same key on any machine.
pub fn compute_key(
    stage: &str,
    version: u32,
    params: &ResolvedParams,
    inputs: &[InputFingerprint],
) -> ArtifactKey {
    let document = json!({
        "schema": KEY_SCHEMA,
        "stage": stage,
        "version": version,
        "params": params,
        "inputs": inputs.iter().map(InputFingerprint::to_value).collect::<Vec<_>>(),
    });
    ArtifactKey(hash_value(&document))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub stage: String,
    pub version: u32,
    pub params: ResolvedParams,
    pub artifact_type: ArtifactType,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub key: ArtifactKey,
    pub payload: Payload,
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    pub fn new(
        key: ArtifactKey,
        stage: &str,
        version: u32,
        params: ResolvedParams,
        payload: Payload,
        duration_ms: u64,
    ) -> Result<Self, PayloadError> {
        let bytes = payload.canonical_bytes()?;
        let metadata = ArtifactMetadata {
            stage: stage.to_string(),
            version,
            params,
            artifact_type: payload.artifact_type(),
            created_at: Utc::now(),
            duration_ms,
            size_bytes: bytes.len() as u64,
            content_hash: hash_bytes(&bytes),
        };
        Ok(Self {
            key,
            payload,
            metadata,
        })
    }

    pub fn content_hash(&self) -> &str {
        &self.metadata.content_hash
    }
}

/// The `artifacts` collection document. Holds the locator, never the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub key: ArtifactKey,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub metadata: ArtifactMetadata,
    pub storage_locator: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: i64) -> ResolvedParams {
        let mut p = ResolvedParams::new();
        p.insert("k".into(), json!(k));
        p.insert("seed".into(), json!(0));
        p
    }

    #[test]
    fn keys_are_deterministic_and_sensitive() {
        let inputs = vec![InputFingerprint::Sample("abc".into())];
        let a = compute_key("cluster", 2, &params(5), &inputs);
        let b = compute_key("cluster", 2, &params(5), &inputs);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        assert_ne!(a, compute_key("cluster", 1, &params(5), &inputs));
        assert_ne!(a, compute_key("cluster", 2, &params(8), &inputs));
        assert_ne!(a, compute_key("normalize", 2, &params(5), &inputs));
    }

    #[test]
    fn sample_and_artifact_inputs_never_collide() {
        let as_sample = vec![InputFingerprint::Sample("deadbeef".into())];
        let as_artifact = vec![InputFingerprint::Artifact(ArtifactKey::from_hex("deadbeef"))];
        assert_ne!(
            compute_key("embed", 1, &params(2), &as_sample),
            compute_key("embed", 1, &params(2), &as_artifact)
        );
    }

    #[test]
    fn input_order_is_significant() {
        let a = InputFingerprint::Artifact(ArtifactKey::from_hex("aa"));
        let b = InputFingerprint::Artifact(ArtifactKey::from_hex("bb"));
        assert_ne!(
            compute_key("summarize", 1, &params(5), &[a.clone(), b.clone()]),
            compute_key("summarize", 1, &params(5), &[b, a])
        );
    }

    #[test]
    fn locator_fans_out_by_prefix() {
        let key = ArtifactKey::from_hex("abcdef0123");
        assert_eq!(key.locator(), "artifacts/ab/cd/abcdef0123");
    }

    #[test]
    fn payload_round_trips_through_canonical_bytes() {
        let payload = Payload::Labels(vec![0, 1, 1, 2]);
        let decoded: Payload = serde_json::from_slice(&payload.canonical_bytes().unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.artifact_type(), ArtifactType::Labels);
    }

    #[test]
    fn non_finite_values_are_not_encoded() {
        let table = Table::new(
            vec!["CD3".into(), "CD4".into()],
            vec![vec![1.0, 2.0], vec![3.0, f64::NAN]],
        );
        let err = Payload::Embedding(table).canonical_bytes().unwrap_err();
        assert_eq!(
            err,
            PayloadError::NonFinite {
                column: "CD4".into(),
                row: 1
            }
        );

        let ragged = Table::new(vec!["CD3".into()], vec![vec![1.0, f64::INFINITY]]);
        assert!(matches!(
            Payload::Table(ragged).canonical_bytes(),
            Err(PayloadError::RaggedRow { row: 0, .. })
        ));
    }
}
