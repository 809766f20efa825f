//! Factorization-machine scores.
//!
//! For one draw `(w0, w, V)` and a row `x`:
//!
//! ```text
//! score(x) = w0 + x·w + 0.5 * [ Σ_r (x·V[:,r])^2 − Σ_r (x²·V[:,r]²) ]
//! ```
//!
//! The first bracketed sum expands every pairwise product including the
//! self terms `x_i^2 V_ir^2`; the second removes them. Cost is linear in
//! the number of stored entries times the rank.

use crate::estimate::FmError;
use crate::matrix::FeatureMatrix;
use crate::types::FmSample;
use ndarray::{Array1, Axis};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

/// A feature matrix paired with its element-wise square.
///
/// The square only depends on the inputs, so it is computed once and reused
/// across every posterior draw.
#[derive(Clone, Debug)]
pub struct ScoringInput {
    x: FeatureMatrix,
    x_sq: FeatureMatrix,
}

impl ScoringInput {
    pub fn new(x: FeatureMatrix) -> Result<Self, FmError> {
        let x_sq = x.elementwise_square()?;
        Ok(Self { x, x_sq })
    }

    pub fn nrows(&self) -> usize {
        self.x.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.x.ncols()
    }

    pub fn x(&self) -> &FeatureMatrix {
        &self.x
    }

    pub fn x_squared(&self) -> &FeatureMatrix {
        &self.x_sq
    }
}

/// Raw score of every row under a single draw.
pub fn score_point(sample: &FmSample, input: &ScoringInput) -> Result<Array1<f64>, FmError> {
    if input.ncols() != sample.n_features() || sample.V.nrows() != sample.n_features() {
        return Err(FmError::DimensionMismatch {
            expected: sample.n_features(),
            found: input.ncols(),
        });
    }
    let x = input.x();

    let mut score = x.dot_vector(sample.w.view());
    score += sample.w0;

    if sample.rank() > 0 {
        let xv = x.dot_matrix(sample.V.view());
        let full = xv.mapv(|v| v * v).sum_axis(Axis(1));
        let v_sq_rows = sample.V.mapv(|v| v * v).sum_axis(Axis(1));
        let self_terms = input.x_squared().dot_vector(v_sq_rows.view());
        score.scaled_add(0.5, &(full - self_terms));
    }
    Ok(score)
}

/// Equal-weight mean of the raw scores over every draw.
pub fn score_mean(samples: &[FmSample], input: &ScoringInput) -> Result<Array1<f64>, FmError> {
    if samples.is_empty() {
        return Err(FmError::NoPosteriorSamples);
    }
    let n = input.nrows();
    let total = samples
        .par_iter()
        .map(|sample| score_point(sample, input))
        .try_reduce(|| Array1::<f64>::zeros(n), |acc, next| Ok(acc + next))?;
    Ok(total / samples.len() as f64)
}
