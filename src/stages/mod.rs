//! Reference stages registered by default. They are deliberately simple;
//! real analyses register their own implementations next to these.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::artifact::{ArtifactType, Payload, Table};
use crate::error::RegistryError;
use crate::params::{ParamSpec, ResolvedParams};
use crate::registry::{
    StageContext, StageDefinition, StageFailure, StageImplementation, StageInputs, StageRegistry,
};

mod cluster;
mod embed;

pub use cluster::{ClusterStage, kmeans};
pub use embed::EmbedStage;

/// Rows processed between cancellation checkpoints.
const CHECKPOINT_ROWS: usize = 4096;

pub fn register_defaults(registry: &mut StageRegistry) -> Result<(), RegistryError> {
    registry.register(
        StageDefinition::new("normalize", 1, ArtifactType::Table)
            .describe("Per-marker intensity transform (arcsinh, log or linear scaling)")
            .input("data", ArtifactType::Table)
            .param(ParamSpec::choice("method", &["arcsinh", "log", "linear"]).default("arcsinh"))
            .param(ParamSpec::float("cofactor").float_range(1e-6, 1e6).default(5.0)),
        NormalizeStage,
    )?;
    registry.register(
        StageDefinition::new("gate", 1, ArtifactType::Table)
            .describe("Keep events above or below a threshold on one marker")
            .input("data", ArtifactType::Table)
            .param(ParamSpec::string("marker"))
            .param(ParamSpec::float("threshold"))
            .param(ParamSpec::choice("direction", &["above", "below"]).default("above")),
        GateStage,
    )?;
    registry.register(
        StageDefinition::new("cluster", 2, ArtifactType::Labels)
            .describe("Seeded k-means over all markers")
            .input("data", ArtifactType::Table)
            .param(ParamSpec::integer("k").int_range(2, 256).default(5))
            .param(ParamSpec::integer("max_iter").int_range(1, 10_000).default(100))
            .param(ParamSpec::seed())
            .stochastic(),
        ClusterStage,
    )?;
    registry.register(
        StageDefinition::new("embed", 1, ArtifactType::Embedding)
            .describe("Seeded Gaussian random projection to a few dimensions")
            .input("data", ArtifactType::Table)
            .param(ParamSpec::integer("dims").int_range(1, 16).default(2))
            .param(ParamSpec::seed())
            .stochastic(),
        EmbedStage,
    )?;
    registry.register(
        StageDefinition::new("summarize", 1, ArtifactType::Report)
            .describe("Per-cluster event counts, proportions and marker means")
            .input("data", ArtifactType::Table)
            .input("labels", ArtifactType::Labels),
        SummarizeStage,
    )?;
    Ok(())
}

pub(crate) fn param_f64(params: &ResolvedParams, key: &str) -> Result<f64, StageFailure> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| StageFailure::deterministic(format!("parameter '{key}' is missing or not a number")))
}

pub(crate) fn param_u64(params: &ResolvedParams, key: &str) -> Result<u64, StageFailure> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| StageFailure::deterministic(format!("parameter '{key}' is missing or negative")))
}

pub(crate) fn param_str<'a>(params: &'a ResolvedParams, key: &str) -> Result<&'a str, StageFailure> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StageFailure::deterministic(format!("parameter '{key}' is missing or not a string")))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Transform {
    Arcsinh,
    Log,
    Linear,
}

struct NormalizeStage;

impl NormalizeStage {
    fn options(params: &ResolvedParams) -> Result<(Transform, f64), StageFailure> {
        let transform = match param_str(params, "method")? {
            "arcsinh" => Transform::Arcsinh,
            "log" => Transform::Log,
            "linear" => Transform::Linear,
            other => {
                return Err(StageFailure::deterministic(format!(
                    "unsupported normalisation method '{other}'"
                )));
            }
        };
        Ok((transform, param_f64(params, "cofactor")?))
    }
}

impl StageImplementation for NormalizeStage {
    fn execute(
        &self,
        inputs: &StageInputs,
        params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure> {
        let table = inputs.table("data")?;
        let (transform, cofactor) = Self::options(params)?;

        let mut rows = Vec::with_capacity(table.rows.len());
        for (idx, row) in table.rows.iter().enumerate() {
            if idx % CHECKPOINT_ROWS == 0 {
                ctx.checkpoint()?;
            }
            rows.push(
                row.iter()
                    .map(|&x| match transform {
                        Transform::Arcsinh => (x / cofactor).asinh(),
                        // Negative intensities are clamped so the output stays finite.
                        Transform::Log => (x.max(0.0) / cofactor).ln_1p(),
                        Transform::Linear => x / cofactor,
                    })
                    .collect(),
            );
        }
        Ok(Payload::Table(Table::new(table.columns.clone(), rows)))
    }
}

struct GateStage;

impl StageImplementation for GateStage {
    fn execute(
        &self,
        inputs: &StageInputs,
        params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure> {
        let table = inputs.table("data")?;
        let marker = param_str(params, "marker")?;
        let threshold = param_f64(params, "threshold")?;
        let above = param_str(params, "direction")? == "above";

        let column = table.column_index(marker).ok_or_else(|| {
            StageFailure::deterministic(format!(
                "marker '{marker}' is not in the panel [{}]",
                table.columns.join(", ")
            ))
        })?;
        ctx.checkpoint()?;

        let rows = table
            .rows
            .iter()
            .filter(|row| {
                let value = row[column];
                if above { value > threshold } else { value <= threshold }
            })
            .cloned()
            .collect();
        Ok(Payload::Table(Table::new(table.columns.clone(), rows)))
    }
}

struct SummarizeStage;

impl StageImplementation for SummarizeStage {
    fn execute(
        &self,
        inputs: &StageInputs,
        _params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure> {
        let table = inputs.table("data")?;
        let labels = inputs.labels("labels")?;
        if labels.len() != table.n_events() {
            return Err(StageFailure::deterministic(format!(
                "{} labels for {} events",
                labels.len(),
                table.n_events()
            )));
        }
        ctx.checkpoint()?;

        let mut sums: BTreeMap<u32, (usize, Vec<f64>)> = BTreeMap::new();
        for (row, &label) in table.rows.iter().zip(labels) {
            let entry = sums
                .entry(label)
                .or_insert_with(|| (0, vec![0.0; table.columns.len()]));
            entry.0 += 1;
            for (acc, value) in entry.1.iter_mut().zip(row) {
                *acc += value;
            }
        }

        let total = table.n_events();
        let clusters: Vec<Value> = sums
            .into_iter()
            .map(|(cluster_id, (n_events, totals))| {
                let means: Map<String, Value> = table
                    .columns
                    .iter()
                    .zip(totals)
                    .map(|(marker, sum)| (marker.clone(), json!(sum / n_events as f64)))
                    .collect();
                json!({
                    "cluster_id": cluster_id,
                    "n_events": n_events,
                    "prop_of_root": n_events as f64 / total as f64,
                    "marker_means": means,
                })
            })
            .collect();

        Ok(Payload::Report(json!({
            "n_events": total,
            "n_clusters": clusters.len(),
            "clusters": clusters,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CancelToken;
    use std::sync::Arc;

    fn inputs(entries: Vec<(&str, Payload)>) -> StageInputs {
        StageInputs::new(
            entries
                .into_iter()
                .map(|(name, payload)| (name.to_string(), Arc::new(payload)))
                .collect(),
        )
    }

    fn table() -> Table {
        Table::new(
            vec!["CD4".into(), "CD8".into()],
            vec![vec![0.0, 10.0], vec![5.0, 20.0], vec![50.0, 1.0]],
        )
    }

    fn resolve(registry: &StageRegistry, stage: &str, params: Value) -> ResolvedParams {
        registry
            .latest(stage)
            .unwrap()
            .definition
            .params
            .resolve(params.as_object().unwrap())
            .unwrap()
    }

    fn ctx() -> StageContext {
        StageContext::new("test", CancelToken::new())
    }

    #[test]
    fn defaults_register_cleanly() {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry).unwrap();
        assert_eq!(
            registry.known_stages(),
            vec!["cluster", "embed", "gate", "normalize", "summarize"]
        );
        assert_eq!(registry.latest("cluster").unwrap().definition.version, 2);
    }

    #[test]
    fn normalize_applies_arcsinh_with_cofactor() {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry).unwrap();
        let params = resolve(&registry, "normalize", json!({}));
        let out = NormalizeStage
            .execute(&inputs(vec![("data", Payload::Table(table()))]), &params, &ctx())
            .unwrap();
        let Payload::Table(out) = out else {
            panic!("expected a table")
        };
        assert_eq!(out.rows[1][0], (1.0f64).asinh());
        assert_eq!(out.columns, table().columns);
    }

    #[test]
    fn gate_filters_and_rejects_unknown_markers() {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry).unwrap();
        let data = inputs(vec![("data", Payload::Table(table()))]);

        let params = resolve(&registry, "gate", json!({"marker": "CD4", "threshold": 1.0}));
        let Payload::Table(out) = GateStage.execute(&data, &params, &ctx()).unwrap() else {
            panic!("expected a table")
        };
        assert_eq!(out.n_events(), 2);

        let params = resolve(&registry, "gate", json!({"marker": "CD19", "threshold": 1.0}));
        let err = GateStage.execute(&data, &params, &ctx()).unwrap_err();
        assert_eq!(err.kind, crate::registry::FailureKind::Deterministic);
    }

    #[test]
    fn summarize_reports_proportions() {
        let data = inputs(vec![
            ("data", Payload::Table(table())),
            ("labels", Payload::Labels(vec![0, 0, 1])),
        ]);
        let Payload::Report(report) = SummarizeStage
            .execute(&data, &ResolvedParams::new(), &ctx())
            .unwrap()
        else {
            panic!("expected a report")
        };
        assert_eq!(report["n_events"], json!(3));
        assert_eq!(report["clusters"][0]["n_events"], json!(2));
        assert_eq!(report["clusters"][1]["cluster_id"], json!(1));
        assert_eq!(report["clusters"][0]["marker_means"]["CD8"], json!(15.0));
    }
}
