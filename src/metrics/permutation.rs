//! Permutation test for the significance of an observed NCD.
//!
//! Events from both groups are pooled, shuffled with a PRNG seeded only
//! from the caller's seed, and split back into groups of the original
//! sizes. The share of shuffles whose NCD reaches the observed value is the
//! p-value, with the usual add-one correction.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::ncd::{compute_components, frame_events};
use crate::compression::Compressor;
use crate::detect::{DetectError, Result};

/// Outcome of one permutation test.
#[derive(Debug, Clone, PartialEq)]
pub struct PermutationResult {
    pub observed_ncd: f64,
    pub p_value: f64,
    pub permutations: usize,
    /// Resampled NCDs that were `>=` the observed one.
    pub exceedances: usize,
    pub null_mean: f64,
    pub null_std_dev: f64,
}

pub struct PermutationSignificanceTester {
    compressor: Arc<dyn Compressor>,
}

impl PermutationSignificanceTester {
    pub fn new(compressor: Arc<dyn Compressor>) -> Self {
        Self { compressor }
    }

    /// Compute the observed NCD between the two event groups, then run
    /// `permutations` event-level shuffles.
    pub fn test<E: AsRef<[u8]>>(
        &self,
        baseline: &[E],
        window: &[E],
        seed: u64,
        permutations: usize,
    ) -> Result<PermutationResult> {
        check_groups(baseline, window)?;
        let observed = compute_components(
            &frame_events(baseline),
            &frame_events(window),
            self.compressor.as_ref(),
        )?
        .ncd();
        self.test_against(observed, baseline, window, seed, permutations)
    }

    /// Like [`test`](Self::test) with the observed NCD supplied by the
    /// caller, which already has it from the metrics pass.
    pub fn test_against<E: AsRef<[u8]>>(
        &self,
        observed_ncd: f64,
        baseline: &[E],
        window: &[E],
        seed: u64,
        permutations: usize,
    ) -> Result<PermutationResult> {
        check_groups(baseline, window)?;

        let pool: Vec<&[u8]> = baseline
            .iter()
            .chain(window.iter())
            .map(|e| e.as_ref())
            .collect();
        let split = baseline.len();
        let mut order: Vec<usize> = (0..pool.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut exceedances = 0usize;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;

        for _ in 0..permutations {
            order.shuffle(&mut rng);
            let (left, right) = order.split_at(split);
            let a = frame_events(left.iter().map(|&i| pool[i]));
            let b = frame_events(right.iter().map(|&i| pool[i]));

            let resampled = compute_components(&a, &b, self.compressor.as_ref())?.ncd();
            if resampled >= observed_ncd {
                exceedances += 1;
            }
            sum += resampled;
            sum_sq += resampled * resampled;
        }

        let p_value = (exceedances as f64 + 1.0) / (permutations as f64 + 1.0);
        let (null_mean, null_std_dev) = if permutations > 0 {
            let n = permutations as f64;
            let mean = sum / n;
            let var = (sum_sq / n - mean * mean).max(0.0);
            (mean, var.sqrt())
        } else {
            (0.0, 0.0)
        };

        debug!(
            observed_ncd,
            p_value,
            exceedances,
            permutations,
            seed,
            "permutation test complete"
        );

        Ok(PermutationResult {
            observed_ncd,
            p_value,
            permutations,
            exceedances,
            null_mean,
            null_std_dev,
        })
    }
}

fn check_groups<E: AsRef<[u8]>>(baseline: &[E], window: &[E]) -> Result<()> {
    if baseline.is_empty() || window.is_empty() {
        return Err(DetectError::EmptyInput);
    }
    Ok(())
}
