//! Gibbs sampler for Bayesian factorization machines.
//!
//! Each sweep draws every parameter from its full conditional:
//!
//! - noise precision `alpha` (regression only; fixed at 1 under the probit
//!   likelihood),
//! - per-group `lambda_w`, `mu_w`, then per group x factor `lambda_V`, `mu_V`,
//! - bias `w0`, every linear weight `w_i`, every factor `V_if`,
//! - for classification, every latent utility `z_n` from a one-sided
//!   truncated normal.
//!
//! The score is linear in any single coordinate `θ`:
//! `score(x) = g(x) + θ h_θ(x)`, with `h = 1` for `w0`, `h = x_i` for `w_i`
//! and `h = x_i (q_f(x) − x_i V_if)` for `V_if`, where `q = X V`. Keeping the
//! residuals `target − score` and `q` cached makes each coordinate update
//! cost one pass over the stored entries of its column.

use crate::config::Config;
use crate::matrix::{FeatureMatrix, flatten};
use crate::probability::{sample_truncated_normal_above, sample_truncated_normal_below};
use crate::sampler::{IterationCallback, PosteriorDraws, Sampler, SamplerError, SamplerInput};
use crate::scoring::{ScoringInput, score_point};
use crate::types::{FmSample, HyperSample, TaskType};
use ndarray::{Array1, Array2};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Gamma, Normal, StandardNormal};

/// The built-in engine. Stateless between runs; all randomness derives
/// from the run's seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct GibbsSampler;

impl GibbsSampler {
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for GibbsSampler {
    fn run(
        &mut self,
        input: SamplerInput<'_>,
        config: &Config,
        callback: &mut IterationCallback<'_>,
    ) -> Result<PosteriorDraws, SamplerError> {
        let x = flatten(input.x, input.relations)
            .map_err(|e| SamplerError::Message(format!("failed to flatten features: {e}")))?;
        if input.y.len() != x.nrows() {
            return Err(SamplerError::Message(format!(
                "target length {} does not match {} feature rows",
                input.y.len(),
                x.nrows()
            )));
        }
        if config.groups().dim() != x.ncols() {
            return Err(SamplerError::Message(format!(
                "group structure covers {} columns but the design has {}",
                config.groups().dim(),
                x.ncols()
            )));
        }

        let mut rng = StdRng::seed_from_u64(input.seed);
        let mut state = GibbsState::initialize(&x, input, config, &mut rng)?;
        let mut draws = PosteriorDraws::default();

        log::debug!(
            "gibbs: {} rows, {} columns ({} stored), rank {}, {} groups, {} iterations",
            x.nrows(),
            x.ncols(),
            x.nnz(),
            input.rank,
            config.groups().n_groups(),
            config.n_iter()
        );

        for iteration in 0..config.n_iter() {
            state.sweep(&x, config, &mut rng, iteration)?;
            if config.is_kept_iteration(iteration) {
                draws.fms.push(state.fm.clone());
                draws.hypers.push(state.hyper.clone());
            }
            if callback(iteration, &state.fm, &state.hyper) {
                log::info!(
                    "gibbs: stopped by callback after iteration {iteration}; {} draws kept",
                    draws.fms.len()
                );
                break;
            }
        }
        Ok(draws)
    }
}

fn gamma_draw(
    rng: &mut StdRng,
    shape: f64,
    rate: f64,
    what: &str,
) -> Result<f64, SamplerError> {
    let dist = Gamma::new(shape, 1.0 / rate).map_err(|e| SamplerError::InvalidDistribution {
        what: what.to_string(),
        detail: format!("shape={shape}, rate={rate}: {e:?}"),
    })?;
    Ok(dist.sample(rng))
}

#[inline]
fn gaussian_draw(rng: &mut StdRng, mean: f64, precision: f64) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    mean + z / precision.sqrt()
}

struct GibbsState {
    fm: FmSample,
    hyper: HyperSample,
    /// Observed targets (regression) or latent utilities (classification).
    target: Array1<f64>,
    /// `target − score` for every row.
    residual: Array1<f64>,
    /// `X V`, rows x rank.
    q: Array2<f64>,
    /// ±1 labels; present only for classification.
    labels: Option<Array1<f64>>,
    group_of: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl GibbsState {
    fn initialize(
        x: &FeatureMatrix,
        input: SamplerInput<'_>,
        config: &Config,
        rng: &mut StdRng,
    ) -> Result<Self, SamplerError> {
        let p = x.ncols();
        let k = input.rank;
        let init = Normal::new(0.0, input.init_stdev).map_err(|e| {
            SamplerError::InvalidDistribution {
                what: "initial weights".to_string(),
                detail: format!("init_stdev={}: {e:?}", input.init_stdev),
            }
        })?;
        let w0 = init.sample(rng);
        let w = Array1::from_shape_fn(p, |_| init.sample(rng));
        let v = Array2::from_shape_fn((p, k), |_| init.sample(rng));
        let fm = FmSample { w0, w, V: v };

        let n_groups = config.groups().n_groups();
        let hyper = HyperSample {
            alpha: 1.0,
            mu_w: Array1::zeros(n_groups),
            lambda_w: Array1::ones(n_groups),
            mu_V: Array2::zeros((n_groups, k)),
            lambda_V: Array2::ones((n_groups, k)),
        };

        let scoring = ScoringInput::new(x.clone())
            .map_err(|e| SamplerError::Message(format!("failed to prepare scoring input: {e}")))?;
        let score = score_point(&fm, &scoring)
            .map_err(|e| SamplerError::Message(format!("failed to score initial draw: {e}")))?;
        let q = x.dot_matrix(fm.V.view());

        let labels = match config.task_type() {
            TaskType::Regression => None,
            TaskType::Classification => Some(input.y.mapv(|v| if v > 0.0 { 1.0 } else { -1.0 })),
        };
        let target = input.y.to_owned();
        let residual = &target - &score;

        let mut state = Self {
            fm,
            hyper,
            target,
            residual,
            q,
            labels,
            group_of: (0..p).map(|i| config.groups().group_of(i)).collect(),
            members: config.groups().members(),
        };
        state.sample_latent(rng);
        Ok(state)
    }

    fn sweep(
        &mut self,
        x: &FeatureMatrix,
        config: &Config,
        rng: &mut StdRng,
        iteration: usize,
    ) -> Result<(), SamplerError> {
        if config.task_type() == TaskType::Regression {
            self.sample_alpha(config, rng)?;
        }
        self.sample_linear_hyper(config, rng)?;
        self.sample_factor_hyper(config, rng)?;
        self.sample_w0(config, rng);
        self.sample_w(x, rng);
        self.sample_v(x, rng);
        self.sample_latent(rng);

        if !self.fm.w0.is_finite() || !self.hyper.alpha.is_finite() {
            return Err(SamplerError::NonFinite {
                what: "bias or noise precision",
                iteration,
            });
        }
        if self.residual.iter().any(|r| !r.is_finite()) {
            return Err(SamplerError::NonFinite {
                what: "residual",
                iteration,
            });
        }
        Ok(())
    }

    fn sample_alpha(&mut self, config: &Config, rng: &mut StdRng) -> Result<(), SamplerError> {
        let n = self.residual.len() as f64;
        let sse = self.residual.dot(&self.residual);
        let shape = 0.5 * (config.alpha_0() + n);
        let rate = 0.5 * (config.beta_0() + sse);
        self.hyper.alpha = gamma_draw(rng, shape, rate, "alpha")?;
        Ok(())
    }

    fn sample_linear_hyper(&mut self, config: &Config, rng: &mut StdRng) -> Result<(), SamplerError> {
        for (g, members) in self.members.iter().enumerate() {
            let n_g = members.len() as f64;
            let mu = self.hyper.mu_w[g];
            let spread: f64 = members.iter().map(|&i| (self.fm.w[i] - mu).powi(2)).sum();
            let shape = 0.5 * (config.alpha_0() + n_g + 1.0);
            let rate =
                0.5 * (config.beta_0() + config.gamma_0() * (mu - config.mu_0()).powi(2) + spread);
            let lambda = gamma_draw(rng, shape, rate, "lambda_w")?;
            self.hyper.lambda_w[g] = lambda;

            let sum: f64 = members.iter().map(|&i| self.fm.w[i]).sum();
            let denom = n_g + config.gamma_0();
            let mean = (sum + config.gamma_0() * config.mu_0()) / denom;
            self.hyper.mu_w[g] = gaussian_draw(rng, mean, denom * lambda);
        }
        Ok(())
    }

    fn sample_factor_hyper(&mut self, config: &Config, rng: &mut StdRng) -> Result<(), SamplerError> {
        let k = self.fm.V.ncols();
        for (g, members) in self.members.iter().enumerate() {
            let n_g = members.len() as f64;
            for f in 0..k {
                let mu = self.hyper.mu_V[[g, f]];
                let spread: f64 = members
                    .iter()
                    .map(|&i| (self.fm.V[[i, f]] - mu).powi(2))
                    .sum();
                let shape = 0.5 * (config.alpha_0() + n_g + 1.0);
                let rate = 0.5
                    * (config.beta_0() + config.gamma_0() * (mu - config.mu_0()).powi(2) + spread);
                let lambda = gamma_draw(rng, shape, rate, "lambda_V")?;
                self.hyper.lambda_V[[g, f]] = lambda;

                let sum: f64 = members.iter().map(|&i| self.fm.V[[i, f]]).sum();
                let denom = n_g + config.gamma_0();
                let mean = (sum + config.gamma_0() * config.mu_0()) / denom;
                self.hyper.mu_V[[g, f]] = gaussian_draw(rng, mean, denom * lambda);
            }
        }
        Ok(())
    }

    fn sample_w0(&mut self, config: &Config, rng: &mut StdRng) {
        let alpha = self.hyper.alpha;
        let n = self.residual.len() as f64;
        let old = self.fm.w0;
        let precision = config.reg_0() + alpha * n;
        let mean = alpha * (self.residual.sum() + n * old) / precision;
        let new = gaussian_draw(rng, mean, precision);
        self.residual -= new - old;
        self.fm.w0 = new;
    }

    fn sample_w(&mut self, x: &FeatureMatrix, rng: &mut StdRng) {
        let alpha = self.hyper.alpha;
        for i in 0..x.ncols() {
            let g = self.group_of[i];
            let lambda = self.hyper.lambda_w[g];
            let old = self.fm.w[i];

            let mut sum_h2 = 0.0;
            let mut sum_hr = 0.0;
            for (row, v) in x.column(i) {
                sum_h2 += v * v;
                sum_hr += v * self.residual[row];
            }
            let precision = alpha * sum_h2 + lambda;
            let mean = (alpha * (sum_hr + old * sum_h2) + lambda * self.hyper.mu_w[g]) / precision;
            let new = gaussian_draw(rng, mean, precision);

            let delta = new - old;
            for (row, v) in x.column(i) {
                self.residual[row] -= delta * v;
            }
            self.fm.w[i] = new;
        }
    }

    fn sample_v(&mut self, x: &FeatureMatrix, rng: &mut StdRng) {
        let alpha = self.hyper.alpha;
        let k = self.fm.V.ncols();
        for f in 0..k {
            for i in 0..x.ncols() {
                let g = self.group_of[i];
                let lambda = self.hyper.lambda_V[[g, f]];
                let old = self.fm.V[[i, f]];

                let mut sum_h2 = 0.0;
                let mut sum_hr = 0.0;
                for (row, v) in x.column(i) {
                    let h = v * (self.q[[row, f]] - v * old);
                    sum_h2 += h * h;
                    sum_hr += h * self.residual[row];
                }
                let precision = alpha * sum_h2 + lambda;
                let mean =
                    (alpha * (sum_hr + old * sum_h2) + lambda * self.hyper.mu_V[[g, f]]) / precision;
                let new = gaussian_draw(rng, mean, precision);

                let delta = new - old;
                for (row, v) in x.column(i) {
                    let h = v * (self.q[[row, f]] - v * old);
                    self.residual[row] -= delta * h;
                    self.q[[row, f]] += delta * v;
                }
                self.fm.V[[i, f]] = new;
            }
        }
    }

    /// Redraws the probit utilities: `z_n > 0` for positive labels and
    /// `z_n < 0` otherwise, each centred on the current score with unit
    /// variance. No-op for regression.
    fn sample_latent(&mut self, rng: &mut StdRng) {
        let Some(labels) = self.labels.as_ref() else {
            return;
        };
        for n in 0..labels.len() {
            let score = self.target[n] - self.residual[n];
            let z = if labels[n] > 0.0 {
                sample_truncated_normal_above(rng, score, 1.0, 0.0)
            } else {
                sample_truncated_normal_below(rng, score, 1.0, 0.0)
            };
            self.target[n] = z;
            self.residual[n] = z - score;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GibbsSampler;
    use crate::config::Config;
    use crate::matrix::{FeatureMatrix, RelationBlock};
    use crate::sampler::{Sampler, SamplerInput};
    use crate::scoring::{ScoringInput, score_point};
    use crate::types::TaskType;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{RngExt, SeedableRng};

    fn linear_problem(n: usize, seed: u64) -> (FeatureMatrix, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut dense = Array2::<f64>::zeros((n, 3));
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            for j in 0..3 {
                dense[[i, j]] = rng.random_range(-1.0..1.0);
            }
            y[i] = 0.5 + 2.0 * dense[[i, 0]] - 1.0 * dense[[i, 1]] + 0.05 * rng.random_range(-1.0..1.0);
        }
        (FeatureMatrix::from_dense(dense.view()).unwrap(), y)
    }

    fn config(task: TaskType, dim: usize, n_iter: usize, kept: usize) -> Config {
        Config::builder()
            .task_type(task)
            .n_iter(n_iter)
            .n_kept_samples(kept)
            .identical_groups(dim)
            .build()
            .unwrap()
    }

    #[test]
    fn keeps_the_trailing_window_and_calls_back_every_sweep() {
        let (x, y) = linear_problem(60, 1);
        let cfg = config(TaskType::Regression, 3, 25, 7);
        let mut seen = Vec::new();
        let draws = GibbsSampler::new()
            .run(
                SamplerInput {
                    rank: 2,
                    init_stdev: 0.1,
                    seed: 3,
                    x: &x,
                    relations: &[],
                    y: y.view(),
                },
                &cfg,
                &mut |i, _, _| {
                    seen.push(i);
                    false
                },
            )
            .unwrap();
        assert_eq!(draws.fms.len(), 7);
        assert_eq!(draws.hypers.len(), 7);
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert!(draws.fms.iter().all(|fm| fm.w.len() == 3 && fm.V.dim() == (3, 2)));
        assert!(draws.hypers.iter().all(|h| h.mu_V.dim() == (1, 2)));
    }

    #[test]
    fn recovers_a_linear_signal() {
        let (x, y) = linear_problem(200, 2);
        let cfg = config(TaskType::Regression, 3, 120, 60);
        let draws = GibbsSampler::new()
            .run(
                SamplerInput {
                    rank: 1,
                    init_stdev: 0.1,
                    seed: 9,
                    x: &x,
                    relations: &[],
                    y: y.view(),
                },
                &cfg,
                &mut |_, _, _| false,
            )
            .unwrap();
        let mean_w0 = draws.fms.iter().map(|fm| fm.w0).sum::<f64>() / draws.fms.len() as f64;
        let mean_w1 = draws.fms.iter().map(|fm| fm.w[0]).sum::<f64>() / draws.fms.len() as f64;
        assert!((mean_w0 - 0.5).abs() < 0.2, "w0={mean_w0}");
        assert!((mean_w1 - 2.0).abs() < 0.3, "w1={mean_w1}");
        let mean_alpha =
            draws.hypers.iter().map(|h| h.alpha).sum::<f64>() / draws.hypers.len() as f64;
        assert!(mean_alpha > 10.0, "alpha={mean_alpha}");
    }

    #[test]
    fn early_stop_truncates_the_run() {
        let (x, y) = linear_problem(30, 4);
        let cfg = config(TaskType::Regression, 3, 50, 50);
        let mut calls = 0;
        let draws = GibbsSampler::new()
            .run(
                SamplerInput {
                    rank: 2,
                    init_stdev: 0.1,
                    seed: 1,
                    x: &x,
                    relations: &[],
                    y: y.view(),
                },
                &cfg,
                &mut |i, _, _| {
                    calls += 1;
                    i == 4
                },
            )
            .unwrap();
        assert_eq!(calls, 5);
        assert_eq!(draws.fms.len(), 5);
    }

    #[test]
    fn same_seed_same_draws() {
        let (x, y) = linear_problem(40, 5);
        let cfg = config(TaskType::Regression, 3, 15, 5);
        let run = |seed| {
            GibbsSampler::new()
                .run(
                    SamplerInput {
                        rank: 2,
                        init_stdev: 0.1,
                        seed,
                        x: &x,
                        relations: &[],
                        y: y.view(),
                    },
                    &cfg,
                    &mut |_, _, _| false,
                )
                .unwrap()
        };
        assert_eq!(run(8).fms, run(8).fms);
        assert_ne!(run(8).fms, run(9).fms);
    }

    #[test]
    fn classification_fixes_alpha_and_separates_classes() {
        let (x, y) = linear_problem(200, 6);
        let labels = y.mapv(|v| if v > 0.5 { 1.0 } else { -1.0 });
        let cfg = config(TaskType::Classification, 3, 80, 40);
        let draws = GibbsSampler::new()
            .run(
                SamplerInput {
                    rank: 1,
                    init_stdev: 0.1,
                    seed: 2,
                    x: &x,
                    relations: &[],
                    y: labels.view(),
                },
                &cfg,
                &mut |_, _, _| false,
            )
            .unwrap();
        assert!(draws.hypers.iter().all(|h| h.alpha == 1.0));
        let input = ScoringInput::new(x.clone()).unwrap();
        let last = score_point(draws.fms.last().unwrap(), &input).unwrap();
        let agree = last
            .iter()
            .zip(labels.iter())
            .filter(|(s, l)| s.signum() == l.signum())
            .count();
        assert!(agree as f64 / labels.len() as f64 > 0.85, "agree={agree}");
    }

    #[test]
    fn relational_columns_are_sampled() {
        let x = FeatureMatrix::empty(4, 0).unwrap();
        let data = FeatureMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (1, 1, 1.0)]).unwrap();
        let block = RelationBlock::new(vec![0, 1, 0, 1], data).unwrap();
        let y = Array1::from(vec![1.0, -1.0, 1.1, -0.9]);
        let cfg = config(TaskType::Regression, 2, 12, 2);
        let draws = GibbsSampler::new()
            .run(
                SamplerInput {
                    rank: 1,
                    init_stdev: 0.1,
                    seed: 0,
                    x: &x,
                    relations: std::slice::from_ref(&block),
                    y: y.view(),
                },
                &cfg,
                &mut |_, _, _| false,
            )
            .unwrap();
        assert_eq!(draws.fms[0].w.len(), 2);
    }

    #[test]
    fn mismatched_group_width_is_rejected() {
        let (x, y) = linear_problem(10, 7);
        let cfg = config(TaskType::Regression, 5, 12, 2);
        let result = GibbsSampler::new().run(
            SamplerInput {
                rank: 1,
                init_stdev: 0.1,
                seed: 0,
                x: &x,
                relations: &[],
                y: y.view(),
            },
            &cfg,
            &mut |_, _, _| false,
        );
        assert!(result.is_err());
    }
}
