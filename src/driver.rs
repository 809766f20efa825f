//! Drives one sampling run: callback selection, progress, held-out
//! evaluation and the training state machine.

use crate::config::Config;
use crate::estimate::FmError;
use crate::features::{AssembledFeatures, assemble};
use crate::matrix::{FeatureMatrix, RelationBlock, flatten};
use crate::sampler::{IterationCallback, PosteriorDraws, Sampler, SamplerInput};
use crate::scoring::{ScoringInput, score_point};
use crate::task::TaskStrategy;
use crate::types::{FmSample, HyperSample, Metric, TrainingState};
use crate::visualizer::{self, VisualizerGuard};
use ndarray::{Array1, ArrayView1};

/// Held-out metrics are computed on every iteration divisible by this.
pub const EVALUATION_INTERVAL: usize = 5;

/// Held-out data in scoring form, with targets already encoded.
#[derive(Clone, Debug)]
pub struct EvaluationSet {
    input: ScoringInput,
    y: Array1<f64>,
}

impl EvaluationSet {
    /// Builds the held-out set when both features and targets are given,
    /// returns `None` when neither is, and fails when only one is.
    ///
    /// `flattened_dim` is the training width; test inputs must flatten to
    /// the same number of columns.
    pub fn from_parts(
        x_test: Option<&FeatureMatrix>,
        relations_test: &[RelationBlock],
        y_test: Option<ArrayView1<'_, f64>>,
        strategy: &TaskStrategy,
        flattened_dim: usize,
    ) -> Result<Option<Self>, FmError> {
        let has_features = x_test.is_some() || !relations_test.is_empty();
        let y_test = match (has_features, y_test) {
            (false, None) => return Ok(None),
            (true, Some(y)) => y,
            _ => return Err(FmError::IncompleteTestSet),
        };
        let assembled = assemble(x_test, relations_test, y_test.len())?;
        if assembled.flattened_dim != flattened_dim {
            return Err(FmError::DimensionMismatch {
                expected: flattened_dim,
                found: assembled.flattened_dim,
            });
        }
        let flat = flatten(&assembled.x, &assembled.relations)?;
        Ok(Some(Self {
            input: ScoringInput::new(flat)?,
            y: (strategy.encode_target)(y_test)?,
        }))
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    fn score(&self, fm: &FmSample) -> Result<Array1<f64>, FmError> {
        score_point(fm, &self.input)
    }

    fn metric(&self, strategy: &TaskStrategy, raw_scores: &Array1<f64>) -> Metric {
        let linked = strategy.apply_link(raw_scores.clone());
        (strategy.loss)(linked.view(), self.y.view())
    }
}

/// Metrics reported at one held-out evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationReport {
    pub iteration: usize,
    /// Loss of the current draw alone.
    pub this_draw: Metric,
    /// Loss of the mean over draws in the kept window seen so far; absent
    /// before the window opens.
    pub posterior_mean: Option<Metric>,
}

/// State of the default callback.
///
/// Owns the progress display; dropping the context restores the terminal,
/// whichever way the run ends.
pub struct SamplingProgress {
    _guard: VisualizerGuard,
    display_active: bool,
    strategy: TaskStrategy,
    evaluation: Option<EvaluationSet>,
    first_kept_iteration: usize,
    kept_seen: usize,
    kept_score_sum: Option<Array1<f64>>,
    reports: Vec<EvaluationReport>,
    failure: Option<FmError>,
}

impl SamplingProgress {
    pub fn new(
        strategy: TaskStrategy,
        config: &Config,
        evaluation: Option<EvaluationSet>,
        show_progress: bool,
    ) -> Self {
        let title = format!("Gibbs sampling ({})", strategy.task_type.name());
        let guard = visualizer::init_guard(show_progress, &title, config.n_iter());
        Self {
            display_active: guard.is_active(),
            _guard: guard,
            strategy,
            evaluation,
            first_kept_iteration: config.first_kept_iteration(),
            kept_seen: 0,
            kept_score_sum: None,
            reports: Vec::new(),
            failure: None,
        }
    }

    /// The per-iteration hook. Never asks for an early stop unless held-out
    /// scoring itself failed, in which case the error is kept for the
    /// driver to surface.
    pub fn observe(&mut self, iteration: usize, fm: &FmSample, hyper: &HyperSample) -> bool {
        match self.observe_inner(iteration, fm, hyper) {
            Ok(()) => false,
            Err(err) => {
                self.failure = Some(err);
                true
            }
        }
    }

    fn observe_inner(
        &mut self,
        iteration: usize,
        fm: &FmSample,
        hyper: &HyperSample,
    ) -> Result<(), FmError> {
        let in_window = iteration >= self.first_kept_iteration;
        if in_window {
            self.kept_seen += 1;
        }
        visualizer::update_iteration(iteration, hyper.alpha, fm.w0, self.kept_seen);
        log::debug!(
            "iteration {iteration}: alpha = {:.4}, w0 = {:.4}",
            hyper.alpha,
            fm.w0
        );

        let evaluate_now = iteration % EVALUATION_INTERVAL == 0;
        let Some(eval) = self.evaluation.as_ref() else {
            if evaluate_now && !self.display_active {
                log::info!(
                    "iteration {iteration}: alpha = {:.2} w0 = {:.2}",
                    hyper.alpha,
                    fm.w0
                );
            }
            return Ok(());
        };
        if !in_window && !evaluate_now {
            return Ok(());
        }

        let scores = eval.score(fm)?;
        if in_window {
            match self.kept_score_sum.as_mut() {
                Some(sum) => *sum += &scores,
                None => self.kept_score_sum = Some(scores.clone()),
            }
        }
        if !evaluate_now {
            return Ok(());
        }

        let this_draw = eval.metric(&self.strategy, &scores);
        let posterior_mean = self.kept_score_sum.as_ref().map(|sum| {
            let mean = sum / self.kept_seen as f64;
            eval.metric(&self.strategy, &mean)
        });
        let report = EvaluationReport {
            iteration,
            this_draw,
            posterior_mean,
        };
        visualizer::update_metric(
            iteration,
            this_draw.name,
            this_draw.value,
            posterior_mean.map(|m| m.value),
        );
        if !self.display_active {
            let mut line = format!(
                "iteration {iteration}: alpha = {:.2} w0 = {:.2} {}_this: {:.4}",
                hyper.alpha, fm.w0, this_draw.name, this_draw.value
            );
            if let Some(mean) = posterior_mean {
                line.push_str(&format!(" {}_mean: {:.4}", mean.name, mean.value));
            }
            log::info!("{line}");
        }
        self.reports.push(report);
        Ok(())
    }

    fn take_failure(&mut self) -> Option<FmError> {
        self.failure.take()
    }
}

/// How the driver reacts after each sweep.
pub enum IterationHook<'a> {
    /// A caller-supplied callback; `true` stops the run.
    Custom(&'a mut IterationCallback<'a>),
    /// Progress display plus periodic held-out evaluation.
    Default(SamplingProgress),
}

/// Validated inputs of one run.
pub struct TrainingRequest<'a> {
    pub rank: usize,
    pub init_stdev: f64,
    pub seed: u64,
    pub features: &'a AssembledFeatures,
    /// Encoded targets.
    pub y: ArrayView1<'a, f64>,
    pub config: &'a Config,
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct TrainingOutcome {
    pub draws: PosteriorDraws,
    pub reports: Vec<EvaluationReport>,
}

/// Single-use state machine around one sampler call.
#[derive(Debug)]
pub struct TrainingDriver {
    state: TrainingState,
}

impl Default for TrainingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingDriver {
    pub fn new() -> Self {
        Self {
            state: TrainingState::NotStarted,
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn run<S: Sampler + ?Sized>(
        &mut self,
        sampler: &mut S,
        request: TrainingRequest<'_>,
        hook: IterationHook<'_>,
    ) -> Result<TrainingOutcome, FmError> {
        if self.state != TrainingState::NotStarted {
            return Err(FmError::InvalidInput(format!(
                "training driver already used (state {:?})",
                self.state
            )));
        }
        self.state = TrainingState::Running;
        log::info!(
            "fitting {} model: {} rows, {} features, rank {}, {} iterations ({} kept)",
            request.config.task_type().name(),
            request.features.n_rows(),
            request.features.flattened_dim,
            request.rank,
            request.config.n_iter(),
            request.config.n_kept_samples()
        );

        let input = SamplerInput {
            rank: request.rank,
            init_stdev: request.init_stdev,
            seed: request.seed,
            x: &request.features.x,
            relations: &request.features.relations,
            y: request.y,
        };

        let result = match hook {
            IterationHook::Custom(callback) => sampler
                .run(input, request.config, callback)
                .map_err(FmError::from)
                .map(|draws| TrainingOutcome {
                    draws,
                    reports: Vec::new(),
                }),
            IterationHook::Default(mut progress) => {
                let run = sampler.run(input, request.config, &mut |i, fm, hyper| {
                    progress.observe(i, fm, hyper)
                });
                match (run, progress.take_failure()) {
                    (_, Some(err)) => Err(err),
                    (Err(err), None) => Err(err.into()),
                    (Ok(draws), None) => Ok(TrainingOutcome {
                        draws,
                        reports: std::mem::take(&mut progress.reports),
                    }),
                }
                // `progress` drops here and releases the display.
            }
        };

        let result = result.and_then(|outcome| {
            check_draws(&outcome.draws, request.config)?;
            Ok(outcome)
        });
        match &result {
            Ok(outcome) => {
                self.state = TrainingState::Completed;
                log::info!("sampling finished with {} kept draws", outcome.draws.fms.len());
            }
            Err(err) => {
                self.state = TrainingState::Failed;
                log::warn!("sampling failed: {err}");
            }
        }
        result
    }
}

/// Draw lists returned by the engine must pair up and respect the
/// configured maximum.
fn check_draws(draws: &PosteriorDraws, config: &Config) -> Result<(), FmError> {
    if draws.fms.len() != draws.hypers.len() {
        return Err(FmError::InvalidInput(format!(
            "sampler returned {} parameter draws but {} hyperparameter draws",
            draws.fms.len(),
            draws.hypers.len()
        )));
    }
    if draws.fms.len() > config.n_kept_samples() {
        return Err(FmError::InvalidInput(format!(
            "sampler returned {} draws, more than the {} configured",
            draws.fms.len(),
            config.n_kept_samples()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{EvaluationSet, IterationHook, SamplingProgress, TrainingDriver, TrainingRequest};
    use crate::config::Config;
    use crate::estimate::FmError;
    use crate::features::assemble;
    use crate::matrix::FeatureMatrix;
    use crate::probability::normal_cdf;
    use crate::sampler::{IterationCallback, PosteriorDraws, Sampler, SamplerError, SamplerInput};
    use crate::task::TaskStrategy;
    use crate::types::{FmSample, HyperSample, TaskType, TrainingState};
    use ndarray::{Array1, Array2, array};

    /// Emits draws whose bias equals the iteration index.
    struct CountingSampler;

    impl Sampler for CountingSampler {
        fn run(
            &mut self,
            input: SamplerInput<'_>,
            config: &Config,
            callback: &mut IterationCallback<'_>,
        ) -> Result<PosteriorDraws, SamplerError> {
            let p = input.x.ncols();
            let mut draws = PosteriorDraws::default();
            for i in 0..config.n_iter() {
                let fm = FmSample {
                    w0: i as f64,
                    w: Array1::zeros(p),
                    V: Array2::zeros((p, input.rank)),
                };
                let hyper = HyperSample {
                    alpha: 1.0,
                    mu_w: Array1::zeros(1),
                    lambda_w: Array1::ones(1),
                    mu_V: Array2::zeros((1, input.rank)),
                    lambda_V: Array2::ones((1, input.rank)),
                };
                if config.is_kept_iteration(i) {
                    draws.fms.push(fm.clone());
                    draws.hypers.push(hyper.clone());
                }
                if callback(i, &fm, &hyper) {
                    break;
                }
            }
            Ok(draws)
        }
    }

    struct FailingSampler;

    impl Sampler for FailingSampler {
        fn run(
            &mut self,
            _input: SamplerInput<'_>,
            _config: &Config,
            _callback: &mut IterationCallback<'_>,
        ) -> Result<PosteriorDraws, SamplerError> {
            Err(SamplerError::Message("boom".to_string()))
        }
    }

    fn config(n_iter: usize, kept: usize) -> Config {
        Config::builder()
            .n_iter(n_iter)
            .n_kept_samples(kept)
            .identical_groups(2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_set_needs_both_parts() {
        let x = FeatureMatrix::empty(3, 2).unwrap();
        let y = array![1.0, 2.0, 3.0];
        let strategy = TaskStrategy::REGRESSION;
        assert!(matches!(
            EvaluationSet::from_parts(Some(&x), &[], None, &strategy, 2),
            Err(FmError::IncompleteTestSet)
        ));
        assert!(matches!(
            EvaluationSet::from_parts(None, &[], Some(y.view()), &strategy, 2),
            Err(FmError::IncompleteTestSet)
        ));
        assert!(
            EvaluationSet::from_parts(None, &[], None, &strategy, 2)
                .unwrap()
                .is_none()
        );
        let set = EvaluationSet::from_parts(Some(&x), &[], Some(y.view()), &strategy, 2)
            .unwrap()
            .unwrap();
        assert_eq!(set.len(), 3);
        assert!(matches!(
            EvaluationSet::from_parts(Some(&x), &[], Some(y.view()), &strategy, 5),
            Err(FmError::DimensionMismatch { expected: 5, found: 2 })
        ));
    }

    #[test]
    fn custom_callback_controls_stopping() {
        let x = FeatureMatrix::empty(3, 2).unwrap();
        let y = array![0.0, 1.0, 2.0];
        let features = assemble(Some(&x), &[], 3).unwrap();
        let cfg = config(20, 20);
        let mut driver = TrainingDriver::new();
        let mut cb = |i: usize, _: &FmSample, _: &HyperSample| i == 6;
        let outcome = driver
            .run(
                &mut CountingSampler,
                TrainingRequest {
                    rank: 2,
                    init_stdev: 0.1,
                    seed: 0,
                    features: &features,
                    y: y.view(),
                    config: &cfg,
                },
                IterationHook::Custom(&mut cb),
            )
            .unwrap();
        assert_eq!(outcome.draws.fms.len(), 7);
        assert_eq!(driver.state(), TrainingState::Completed);
    }

    #[test]
    fn default_hook_reports_every_fifth_iteration() {
        let x = FeatureMatrix::from_triplets(3, 2, &[(0, 0, 1.0)]).unwrap();
        let y = array![0.0, 1.0, 2.0];
        let features = assemble(Some(&x), &[], 3).unwrap();
        let cfg = config(12, 4);
        let eval =
            EvaluationSet::from_parts(Some(&x), &[], Some(y.view()), &TaskStrategy::REGRESSION, 2)
                .unwrap();
        let progress = SamplingProgress::new(TaskStrategy::REGRESSION, &cfg, eval, false);
        let mut driver = TrainingDriver::new();
        let outcome = driver
            .run(
                &mut CountingSampler,
                TrainingRequest {
                    rank: 1,
                    init_stdev: 0.1,
                    seed: 0,
                    features: &features,
                    y: y.view(),
                    config: &cfg,
                },
                IterationHook::Default(progress),
            )
            .unwrap();
        let iterations: Vec<usize> = outcome.reports.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![0, 5, 10]);
        // Kept window opens at iteration 8: no mean before it.
        assert!(outcome.reports[0].posterior_mean.is_none());
        assert!(outcome.reports[1].posterior_mean.is_none());
        // At iteration 10 the kept draws so far have w0 = 8, 9, 10, so every
        // prediction is 9 and the rmse against [0, 1, 2] is sqrt(65.67).
        let mean = outcome.reports[2].posterior_mean.unwrap();
        assert_eq!(mean.name, "rmse");
        let expected = ((81.0 + 64.0 + 49.0) / 3.0_f64).sqrt();
        assert!((mean.value - expected).abs() < 1e-12);
        let this = outcome.reports[2].this_draw;
        let expected_this = ((100.0 + 81.0 + 64.0) / 3.0_f64).sqrt();
        assert!((this.value - expected_this).abs() < 1e-12);
    }

    #[test]
    fn default_hook_reports_log_loss_for_classification() {
        let x = FeatureMatrix::empty(2, 2).unwrap();
        let y_train = array![-1.0, 1.0];
        let y_test = array![0.0, 1.0];
        let features = assemble(Some(&x), &[], 2).unwrap();
        let cfg = Config::builder()
            .task_type(TaskType::Classification)
            .n_iter(12)
            .n_kept_samples(4)
            .identical_groups(2)
            .build()
            .unwrap();
        let strategy = TaskStrategy::CLASSIFICATION;
        let eval = EvaluationSet::from_parts(Some(&x), &[], Some(y_test.view()), &strategy, 2)
            .unwrap();
        let progress = SamplingProgress::new(strategy, &cfg, eval, false);
        let mut driver = TrainingDriver::new();
        let outcome = driver
            .run(
                &mut CountingSampler,
                TrainingRequest {
                    rank: 1,
                    init_stdev: 0.1,
                    seed: 0,
                    features: &features,
                    y: y_train.view(),
                    config: &cfg,
                },
                IterationHook::Default(progress),
            )
            .unwrap();

        // Every test row scores w0, so both rows share one probability.
        let log_loss = |score: f64| {
            let p = normal_cdf(score);
            (-(1.0 - p + 1e-15).ln() - (p + 1e-15).ln()) / 2.0
        };
        let iterations: Vec<usize> = outcome.reports.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![0, 5, 10]);
        assert!(outcome.reports.iter().all(|r| r.this_draw.name == "ll"));

        let first = outcome.reports[0].this_draw.value;
        assert!((first - std::f64::consts::LN_2).abs() < 1e-12);
        assert!((outcome.reports[1].this_draw.value - log_loss(5.0)).abs() < 1e-12);

        // Kept draws 8, 9, 10 average to a score of 9 before the link.
        let mean = outcome.reports[2].posterior_mean.unwrap();
        assert_eq!(mean.name, "ll");
        assert!((mean.value - log_loss(9.0)).abs() < 1e-12);
        assert!((outcome.reports[2].this_draw.value - log_loss(10.0)).abs() < 1e-12);
    }

    #[test]
    fn sampler_failure_marks_driver_failed() {
        let x = FeatureMatrix::empty(2, 2).unwrap();
        let y = array![0.0, 1.0];
        let features = assemble(Some(&x), &[], 2).unwrap();
        let cfg = config(12, 2);
        let mut driver = TrainingDriver::new();
        let progress = SamplingProgress::new(TaskStrategy::REGRESSION, &cfg, None, false);
        let err = driver
            .run(
                &mut FailingSampler,
                TrainingRequest {
                    rank: 1,
                    init_stdev: 0.1,
                    seed: 0,
                    features: &features,
                    y: y.view(),
                    config: &cfg,
                },
                IterationHook::Default(progress),
            )
            .unwrap_err();
        assert!(matches!(err, FmError::Sampler(_)));
        assert_eq!(driver.state(), TrainingState::Failed);
    }

    #[test]
    fn driver_is_single_use() {
        let x = FeatureMatrix::empty(2, 2).unwrap();
        let y = array![0.0, 1.0];
        let features = assemble(Some(&x), &[], 2).unwrap();
        let cfg = config(12, 2);
        let mut driver = TrainingDriver::new();
        let request = || TrainingRequest {
            rank: 1,
            init_stdev: 0.1,
            seed: 0,
            features: &features,
            y: y.view(),
            config: &cfg,
        };
        let mut cb = |_: usize, _: &FmSample, _: &HyperSample| false;
        driver
            .run(&mut CountingSampler, request(), IterationHook::Custom(&mut cb))
            .unwrap();
        assert!(
            driver
                .run(&mut CountingSampler, request(), IterationHook::Custom(&mut cb))
                .is_err()
        );
    }
}
