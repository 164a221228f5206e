use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::artifact::{Payload, Table};
use crate::params::{ResolvedParams, SEED_PARAM};
use crate::registry::{StageContext, StageFailure, StageImplementation, StageInputs};

use super::{CHECKPOINT_ROWS, param_u64};

/// Projects every event onto `dims` Gaussian directions drawn from `seed`.
pub struct EmbedStage;

impl StageImplementation for EmbedStage {
    fn execute(
        &self,
        inputs: &StageInputs,
        params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure> {
        let table = inputs.table("data")?;
        let dims = param_u64(params, "dims")? as usize;
        let seed = param_u64(params, SEED_PARAM)?;

        let markers = table.columns.len();
        if markers == 0 {
            return Err(StageFailure::deterministic("cannot embed a table without markers"));
        }
        let projection = gaussian_matrix(dims, markers, seed);
        let scale = 1.0 / (markers as f64).sqrt();

        let mut rows = Vec::with_capacity(table.n_events());
        for (idx, row) in table.rows.iter().enumerate() {
            if idx % CHECKPOINT_ROWS == 0 {
                ctx.checkpoint()?;
            }
            rows.push(
                projection
                    .iter()
                    .map(|direction| {
                        direction.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() * scale
                    })
                    .collect(),
            );
        }

        let columns = (1..=dims).map(|d| format!("dim_{d}")).collect();
        Ok(Payload::Embedding(Table::new(columns, rows)))
    }
}

fn gaussian_matrix(rows: usize, cols: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows)
        .map(|_| (0..cols).map(|_| standard_normal(&mut rng)).collect())
        .collect()
}

/// Box-Muller; `1 - u` keeps the logarithm away from zero.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.r#gen::<f64>();
    let u2: f64 = rng.r#gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CancelToken;
    use serde_json::json;
    use std::sync::Arc;

    fn run(seed: u64) -> Table {
        let table = Table::new(
            vec!["CD3".into(), "CD4".into(), "CD8".into()],
            vec![vec![1.0, 2.0, 3.0], vec![0.5, 0.0, 9.0]],
        );
        let inputs = StageInputs::new(vec![("data".into(), Arc::new(Payload::Table(table)))]);
        let mut params = ResolvedParams::new();
        params.insert("dims".into(), json!(2));
        params.insert(SEED_PARAM.into(), json!(seed));
        let ctx = StageContext::new("embed", CancelToken::new());
        match EmbedStage.execute(&inputs, &params, &ctx).unwrap() {
            Payload::Embedding(table) => table,
            other => panic!("unexpected payload {:?}", other.artifact_type()),
        }
    }

    #[test]
    fn embedding_is_seeded() {
        let a = run(3);
        assert_eq!(a.columns, vec!["dim_1", "dim_2"]);
        assert_eq!(a.n_events(), 2);
        assert_eq!(a, run(3));
        assert_ne!(a, run(4));
    }
}
