use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

use crate::artifact::Payload;
use crate::params::{ResolvedParams, SEED_PARAM};
use crate::registry::{StageContext, StageFailure, StageImplementation, StageInputs};

use super::param_u64;

/// Lloyd's k-means seeded from `seed`; identical inputs and seed give
/// identical labels on every platform.
pub struct ClusterStage;

impl StageImplementation for ClusterStage {
    fn execute(
        &self,
        inputs: &StageInputs,
        params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure> {
        let table = inputs.table("data")?;
        let k = param_u64(params, "k")? as usize;
        let max_iter = param_u64(params, "max_iter")? as usize;
        let seed = param_u64(params, SEED_PARAM)?;

        let labels = kmeans(&table.rows, k, max_iter, seed, ctx)?;
        Ok(Payload::Labels(labels))
    }
}

pub fn kmeans(
    rows: &[Vec<f64>],
    k: usize,
    max_iter: usize,
    seed: u64,
    ctx: &StageContext,
) -> Result<Vec<u32>, StageFailure> {
    if rows.len() < k {
        return Err(StageFailure::deterministic(format!(
            "cannot form {k} clusters from {} events",
            rows.len()
        )));
    }
    let dims = rows.first().map(Vec::len).unwrap_or(0);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids: Vec<Vec<f64>> = sample(&mut rng, rows.len(), k)
        .into_iter()
        .map(|idx| rows[idx].clone())
        .collect();
    let mut labels = vec![0u32; rows.len()];

    for iteration in 0..max_iter {
        ctx.checkpoint()?;

        let mut changed = iteration == 0;
        for (row, label) in rows.iter().zip(labels.iter_mut()) {
            let nearest = nearest_centroid(row, &centroids);
            if *label != nearest {
                *label = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (row, &label) in rows.iter().zip(&labels) {
            let c = label as usize;
            counts[c] += 1;
            for (acc, value) in sums[c].iter_mut().zip(row) {
                *acc += value;
            }
        }
        for (c, centroid) in centroids.iter_mut().enumerate() {
            // Empty clusters keep their previous centre.
            if counts[c] > 0 {
                for (value, sum) in centroid.iter_mut().zip(&sums[c]) {
                    *value = sum / counts[c] as f64;
                }
            }
        }
    }

    Ok(labels)
}

fn nearest_centroid(row: &[f64], centroids: &[Vec<f64>]) -> u32 {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (idx, centroid) in centroids.iter().enumerate() {
        let dist: f64 = row
            .iter()
            .zip(centroid)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = idx;
        }
    }
    best as u32
}
