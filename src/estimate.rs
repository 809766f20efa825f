//! Estimator surface: fitting, prediction and trace extraction for the
//! regression and classification variants.
//!
//! Both variants share [`FactorizationMachine`]; they differ only in the
//! [`TaskStrategy`] picked at construction.

use crate::config::{Config, resolve_groups};
use crate::driver::{
    EvaluationReport, EvaluationSet, IterationHook, SamplingProgress, TrainingDriver,
    TrainingRequest,
};
use crate::features::assemble;
use crate::gibbs::GibbsSampler;
use crate::matrix::{FeatureMatrix, RelationBlock, flatten};
use crate::sampler::{IterationCallback, Sampler, SamplerError};
use crate::scoring::{ScoringInput, score_mean};
use crate::task::TaskStrategy;
use crate::trace::{PosteriorStore, TraceView};
use crate::types::{FmHyperParams, TaskType, TrainingState};
use ndarray::{Array1, ArrayView1};
use std::fmt;
use thiserror::Error;

/// Every failure the estimator surface can report.
#[derive(Error)]
pub enum FmError {
    #[error("no feature source: supply X, relational blocks, or both")]
    MissingFeatureSource,

    #[error("row count mismatch between {context}: expected {expected}, found {found}")]
    RowCountMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("relational blocks disagree on mapper size: {sizes:?}")]
    RelationDomainMismatch { sizes: Vec<usize> },

    #[error("n_kept_samples ({n_kept_samples}) cannot exceed n_iter ({n_iter})")]
    KeptSamplesExceedIterations { n_kept_samples: usize, n_iter: usize },

    #[error("grouping has {found} labels but X has {expected} columns")]
    GroupingLengthMismatch { expected: usize, found: usize },

    #[error("invalid group labels: {0}")]
    InvalidGroupLabels(String),

    #[error("held-out evaluation needs both test features and test targets")]
    IncompleteTestSet,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no posterior samples available; fit the model first")]
    NoPosteriorSamples,

    #[error("dimension mismatch: model has {expected} features, input has {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("sampler failed: {0}")]
    Sampler(#[from] SamplerError),
}

impl fmt::Debug for FmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Optional arguments of a fit.
pub struct FitOptions<'a> {
    /// Held-out features; requires `y_test`.
    pub x_test: Option<&'a FeatureMatrix>,
    /// Relational blocks of the training rows.
    pub x_rel: &'a [RelationBlock],
    /// Relational blocks of the held-out rows.
    pub x_rel_test: &'a [RelationBlock],
    /// Held-out targets, on the same scale as `y`.
    pub y_test: Option<ArrayView1<'a, f64>>,
    pub n_iter: usize,
    /// Unset means `n_iter - 10`.
    pub n_kept_samples: Option<usize>,
    /// Group label of each explicit column of X.
    pub grouping: Option<&'a [usize]>,
    /// Replaces the default progress/evaluation callback. Returning `true`
    /// stops sampling.
    pub callback: Option<Box<IterationCallback<'a>>>,
    /// Whether the default callback may take over the terminal.
    pub show_progress: bool,
}

impl Default for FitOptions<'_> {
    fn default() -> Self {
        Self {
            x_test: None,
            x_rel: &[],
            x_rel_test: &[],
            y_test: None,
            n_iter: 100,
            n_kept_samples: None,
            grouping: None,
            callback: None,
            show_progress: true,
        }
    }
}

impl fmt::Debug for FitOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FitOptions")
            .field("has_test_set", &(self.x_test.is_some() || self.y_test.is_some()))
            .field("n_relational_blocks", &self.x_rel.len())
            .field("n_iter", &self.n_iter)
            .field("n_kept_samples", &self.n_kept_samples)
            .field("grouping", &self.grouping)
            .field("custom_callback", &self.callback.is_some())
            .field("show_progress", &self.show_progress)
            .finish()
    }
}

/// Shared machinery of both estimator variants.
#[derive(Debug, Clone)]
pub struct FactorizationMachine {
    strategy: TaskStrategy,
    hyper: FmHyperParams,
    posterior: Option<PosteriorStore>,
    evaluation_history: Vec<EvaluationReport>,
    state: TrainingState,
}

impl FactorizationMachine {
    pub fn new(task_type: TaskType, hyper: FmHyperParams) -> Self {
        Self {
            strategy: TaskStrategy::for_task(task_type),
            hyper,
            posterior: None,
            evaluation_history: Vec::new(),
            state: TrainingState::NotStarted,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.strategy.task_type
    }

    pub fn hyper_params(&self) -> &FmHyperParams {
        &self.hyper
    }

    pub fn rank(&self) -> usize {
        self.hyper.rank
    }

    /// Group count of the last successful fit.
    pub fn n_groups(&self) -> Option<usize> {
        self.posterior.as_ref().map(PosteriorStore::n_groups)
    }

    /// State of the most recent sampling run.
    pub fn training_state(&self) -> TrainingState {
        self.state
    }

    pub fn posterior(&self) -> Option<&PosteriorStore> {
        self.posterior.as_ref()
    }

    /// Held-out metrics reported by the default callback during the last
    /// successful fit. Empty without a test set or with a custom callback.
    pub fn evaluation_history(&self) -> &[EvaluationReport] {
        &self.evaluation_history
    }

    /// Fits with the built-in Gibbs sampler.
    pub fn fit(
        &mut self,
        x: Option<&FeatureMatrix>,
        y: ArrayView1<'_, f64>,
        options: FitOptions<'_>,
    ) -> Result<&mut Self, FmError> {
        self.fit_with_sampler(&mut GibbsSampler::new(), x, y, options)
    }

    /// Fits with any sampling engine. The posterior store is replaced only
    /// when the whole run succeeds.
    pub fn fit_with_sampler<S: Sampler + ?Sized>(
        &mut self,
        sampler: &mut S,
        x: Option<&FeatureMatrix>,
        y: ArrayView1<'_, f64>,
        options: FitOptions<'_>,
    ) -> Result<&mut Self, FmError> {
        let FitOptions {
            x_test,
            x_rel,
            x_rel_test,
            y_test,
            n_iter,
            n_kept_samples,
            grouping,
            mut callback,
            show_progress,
        } = options;

        let y = (self.strategy.encode_target)(y)?;
        let features = assemble(x, x_rel, y.len())?;
        let widths: Vec<usize> = features
            .relations
            .iter()
            .map(RelationBlock::feature_size)
            .collect();
        let groups = resolve_groups(grouping, features.n_explicit_columns(), &widths)?;
        let n_groups = groups.n_groups();

        let mut builder = Config::builder()
            .priors(self.hyper.priors)
            .task_type(self.strategy.task_type)
            .n_iter(n_iter)
            .groups(groups);
        if let Some(kept) = n_kept_samples {
            builder = builder.n_kept_samples(kept);
        }
        let config = builder.build()?;
        if config.n_kept_samples() == 0 {
            log::warn!("n_kept_samples is 0; the fit will leave no posterior samples");
        }

        let evaluation = EvaluationSet::from_parts(
            x_test,
            x_rel_test,
            y_test,
            &self.strategy,
            features.flattened_dim,
        )?;

        let hook = match callback.as_deref_mut() {
            Some(cb) => {
                if evaluation.is_some() {
                    log::debug!("custom callback supplied; held-out set is not evaluated");
                }
                IterationHook::Custom(cb)
            }
            None => IterationHook::Default(SamplingProgress::new(
                self.strategy,
                &config,
                evaluation,
                show_progress,
            )),
        };

        let mut driver = TrainingDriver::new();
        let result = driver.run(
            sampler,
            TrainingRequest {
                rank: self.hyper.rank,
                init_stdev: self.hyper.init_stdev,
                seed: self.hyper.random_seed,
                features: &features,
                y: y.view(),
                config: &config,
            },
            hook,
        );
        self.state = driver.state();
        let outcome = result?;

        self.posterior = Some(PosteriorStore::new(
            outcome.draws,
            self.hyper.rank,
            n_groups,
        ));
        self.evaluation_history = outcome.reports;
        Ok(self)
    }

    fn store(&self) -> Result<&PosteriorStore, FmError> {
        match &self.posterior {
            Some(store) if !store.is_empty() => Ok(store),
            _ => Err(FmError::NoPosteriorSamples),
        }
    }

    /// Posterior-mean raw score of every row of `x`.
    pub fn predict_scores(&self, x: &FeatureMatrix) -> Result<Array1<f64>, FmError> {
        let store = self.store()?;
        let input = ScoringInput::new(x.clone())?;
        score_mean(store.fm_samples(), &input)
    }

    /// Posterior-mean raw score of rows described by `x` and relational
    /// blocks, laid out as they were at fit time.
    pub fn predict_scores_with_relations(
        &self,
        x: Option<&FeatureMatrix>,
        relations: &[RelationBlock],
    ) -> Result<Array1<f64>, FmError> {
        let store = self.store()?;
        let n_rows = match (x, relations.first()) {
            (Some(x), _) => x.nrows(),
            (None, Some(block)) => block.mapper_size(),
            (None, None) => return Err(FmError::MissingFeatureSource),
        };
        let features = assemble(x, relations, n_rows)?;
        let input = ScoringInput::new(flatten(&features.x, &features.relations)?)?;
        score_mean(store.fm_samples(), &input)
    }

    /// Posterior-mean score passed through the task's link.
    pub fn predict_linked(&self, x: &FeatureMatrix) -> Result<Array1<f64>, FmError> {
        Ok(self.strategy.apply_link(self.predict_scores(x)?))
    }

    pub fn predict_linked_with_relations(
        &self,
        x: Option<&FeatureMatrix>,
        relations: &[RelationBlock],
    ) -> Result<Array1<f64>, FmError> {
        Ok(self
            .strategy
            .apply_link(self.predict_scores_with_relations(x, relations)?))
    }

    /// Hyperparameter draws as a labelled table, or as one keyed record per
    /// draw when `tabular` is false.
    pub fn hyper_trace(&self, tabular: bool) -> Result<TraceView, FmError> {
        let store = self.posterior.as_ref().ok_or(FmError::NoPosteriorSamples)?;
        let trace = store.hyper_trace();
        Ok(if tabular {
            TraceView::Table(trace)
        } else {
            TraceView::Records(trace.records())
        })
    }
}

fn describe(f: &mut fmt::Formatter<'_>, name: &str, hyper: &FmHyperParams) -> fmt::Result {
    let p = &hyper.priors;
    write!(
        f,
        "{name}(rank={}, init_stdev={}, random_seed={}, alpha_0={}, beta_0={}, gamma_0={}, mu_0={}, reg_0={})",
        hyper.rank,
        hyper.init_stdev,
        hyper.random_seed,
        p.alpha_0,
        p.beta_0,
        p.gamma_0,
        p.mu_0,
        p.reg_0
    )
}

/// Bayesian FM for real-valued targets.
#[derive(Debug, Clone)]
pub struct FmRegressor {
    inner: FactorizationMachine,
}

impl Default for FmRegressor {
    fn default() -> Self {
        Self::new(FmHyperParams::default())
    }
}

impl FmRegressor {
    pub fn new(hyper: FmHyperParams) -> Self {
        Self {
            inner: FactorizationMachine::new(TaskType::Regression, hyper),
        }
    }

    pub fn fit(
        &mut self,
        x: Option<&FeatureMatrix>,
        y: ArrayView1<'_, f64>,
        options: FitOptions<'_>,
    ) -> Result<&mut Self, FmError> {
        self.inner.fit(x, y, options)?;
        Ok(self)
    }

    pub fn fit_with_sampler<S: Sampler + ?Sized>(
        &mut self,
        sampler: &mut S,
        x: Option<&FeatureMatrix>,
        y: ArrayView1<'_, f64>,
        options: FitOptions<'_>,
    ) -> Result<&mut Self, FmError> {
        self.inner.fit_with_sampler(sampler, x, y, options)?;
        Ok(self)
    }

    pub fn predict(&self, x: &FeatureMatrix) -> Result<Array1<f64>, FmError> {
        self.inner.predict_linked(x)
    }

    pub fn predict_with_relations(
        &self,
        x: Option<&FeatureMatrix>,
        relations: &[RelationBlock],
    ) -> Result<Array1<f64>, FmError> {
        self.inner.predict_linked_with_relations(x, relations)
    }

    pub fn hyper_trace(&self, tabular: bool) -> Result<TraceView, FmError> {
        self.inner.hyper_trace(tabular)
    }

    pub fn hyper_params(&self) -> &FmHyperParams {
        self.inner.hyper_params()
    }

    pub fn rank(&self) -> usize {
        self.inner.rank()
    }

    pub fn n_groups(&self) -> Option<usize> {
        self.inner.n_groups()
    }

    pub fn training_state(&self) -> TrainingState {
        self.inner.training_state()
    }

    pub fn posterior(&self) -> Option<&PosteriorStore> {
        self.inner.posterior()
    }

    pub fn evaluation_history(&self) -> &[EvaluationReport] {
        self.inner.evaluation_history()
    }
}

impl fmt::Display for FmRegressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(f, "FmRegressor", self.inner.hyper_params())
    }
}

/// Bayesian FM for `{0, 1}` targets with a probit link.
#[derive(Debug, Clone)]
pub struct FmClassifier {
    inner: FactorizationMachine,
}

impl Default for FmClassifier {
    fn default() -> Self {
        Self::new(FmHyperParams::default())
    }
}

impl FmClassifier {
    pub fn new(hyper: FmHyperParams) -> Self {
        Self {
            inner: FactorizationMachine::new(TaskType::Classification, hyper),
        }
    }

    /// `y` must hold only 0 and 1.
    pub fn fit(
        &mut self,
        x: Option<&FeatureMatrix>,
        y: ArrayView1<'_, f64>,
        options: FitOptions<'_>,
    ) -> Result<&mut Self, FmError> {
        self.inner.fit(x, y, options)?;
        Ok(self)
    }

    pub fn fit_with_sampler<S: Sampler + ?Sized>(
        &mut self,
        sampler: &mut S,
        x: Option<&FeatureMatrix>,
        y: ArrayView1<'_, f64>,
        options: FitOptions<'_>,
    ) -> Result<&mut Self, FmError> {
        self.inner.fit_with_sampler(sampler, x, y, options)?;
        Ok(self)
    }

    /// Probability of the positive class for every row.
    pub fn predict_proba(&self, x: &FeatureMatrix) -> Result<Array1<f64>, FmError> {
        self.inner.predict_linked(x)
    }

    pub fn predict_proba_with_relations(
        &self,
        x: Option<&FeatureMatrix>,
        relations: &[RelationBlock],
    ) -> Result<Array1<f64>, FmError> {
        self.inner.predict_linked_with_relations(x, relations)
    }

    /// `true` where the positive-class probability exceeds 0.5.
    pub fn predict(&self, x: &FeatureMatrix) -> Result<Array1<bool>, FmError> {
        Ok(threshold(self.predict_proba(x)?))
    }

    pub fn predict_with_relations(
        &self,
        x: Option<&FeatureMatrix>,
        relations: &[RelationBlock],
    ) -> Result<Array1<bool>, FmError> {
        Ok(threshold(self.predict_proba_with_relations(x, relations)?))
    }

    pub fn hyper_trace(&self, tabular: bool) -> Result<TraceView, FmError> {
        self.inner.hyper_trace(tabular)
    }

    pub fn hyper_params(&self) -> &FmHyperParams {
        self.inner.hyper_params()
    }

    pub fn rank(&self) -> usize {
        self.inner.rank()
    }

    pub fn n_groups(&self) -> Option<usize> {
        self.inner.n_groups()
    }

    pub fn training_state(&self) -> TrainingState {
        self.inner.training_state()
    }

    pub fn posterior(&self) -> Option<&PosteriorStore> {
        self.inner.posterior()
    }

    pub fn evaluation_history(&self) -> &[EvaluationReport] {
        self.inner.evaluation_history()
    }
}

fn threshold(probability: Array1<f64>) -> Array1<bool> {
    probability.mapv(|p| p > 0.5)
}

impl fmt::Display for FmClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(f, "FmClassifier", self.inner.hyper_params())
    }
}
