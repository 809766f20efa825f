//! Contract between the training driver and a posterior sampling engine.

use crate::config::Config;
use crate::matrix::{FeatureMatrix, RelationBlock};
use crate::types::{FmSample, HyperSample};
use ndarray::ArrayView1;
use thiserror::Error;

/// Per-iteration hook. Receives `(iteration, current draw, current
/// hyperparameters)` after every sweep; returning `true` stops the run.
pub type IterationCallback<'a> = dyn FnMut(usize, &FmSample, &HyperSample) -> bool + 'a;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("invalid distribution parameters for {what}: {detail}")]
    InvalidDistribution { what: String, detail: String },

    #[error("non-finite {what} at iteration {iteration}")]
    NonFinite { what: &'static str, iteration: usize },

    #[error("{0}")]
    Message(String),
}

/// Inputs of one sampling run. `x` may be a zero-column placeholder when all
/// features come from `relations`.
#[derive(Clone, Copy)]
pub struct SamplerInput<'a> {
    pub rank: usize,
    pub init_stdev: f64,
    pub seed: u64,
    pub x: &'a FeatureMatrix,
    pub relations: &'a [RelationBlock],
    /// Already encoded for the task (±1 for classification).
    pub y: ArrayView1<'a, f64>,
}

/// Kept draws of one run, in sampling order. Both lists have equal length.
#[derive(Debug, Clone, Default)]
pub struct PosteriorDraws {
    pub fms: Vec<FmSample>,
    pub hypers: Vec<HyperSample>,
}

/// A posterior sampling engine.
///
/// Implementations run up to `config.n_iter()` sweeps, invoke `callback`
/// synchronously after each one, stop early when it returns `true`, and
/// return only the draws they decided to keep (at most
/// `config.n_kept_samples()`).
pub trait Sampler {
    fn run(
        &mut self,
        input: SamplerInput<'_>,
        config: &Config,
        callback: &mut IterationCallback<'_>,
    ) -> Result<PosteriorDraws, SamplerError>;
}
