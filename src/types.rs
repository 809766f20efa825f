use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Engine-level task selector. Chosen by the estimator variant, never by
/// the configuration layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Regression,
    Classification,
}

impl TaskType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Classification => "classification",
        }
    }
}

/// Lifecycle of one training call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// Gamma/normal prior scalars shared by every group.
///
/// - `alpha`, `lambda_w`, `lambda_V` ~ Gamma(alpha_0 / 2, beta_0 / 2)
/// - `mu_w`, `mu_V` ~ Normal(mu_0, 1 / (gamma_0 * lambda))
/// - `w0` ~ Normal(0, 1 / reg_0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    pub alpha_0: f64,
    pub beta_0: f64,
    pub gamma_0: f64,
    pub mu_0: f64,
    pub reg_0: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            alpha_0: 1.0,
            beta_0: 1.0,
            gamma_0: 1.0,
            mu_0: 0.0,
            reg_0: 1.0,
        }
    }
}

/// Estimator-level hyperparameters fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FmHyperParams {
    /// Number of latent factors.
    pub rank: usize,
    /// Standard deviation of the initial weight draws.
    pub init_stdev: f64,
    pub random_seed: u64,
    #[serde(default)]
    pub priors: PriorConfig,
}

impl FmHyperParams {
    pub fn with_rank(rank: usize) -> Self {
        Self {
            rank,
            ..Self::default()
        }
    }
}

impl Default for FmHyperParams {
    fn default() -> Self {
        Self {
            rank: 8,
            init_stdev: 0.1,
            random_seed: 42,
            priors: PriorConfig::default(),
        }
    }
}

/// One posterior draw of the factorization-machine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FmSample {
    pub w0: f64,
    /// Linear weights, one per flattened feature.
    pub w: Array1<f64>,
    /// Factor matrix, flattened features x rank.
    pub V: Array2<f64>,
}

impl FmSample {
    pub fn n_features(&self) -> usize {
        self.w.len()
    }

    pub fn rank(&self) -> usize {
        self.V.ncols()
    }
}

/// One posterior draw of the hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperSample {
    /// Noise precision. Fixed at 1 for classification.
    pub alpha: f64,
    pub mu_w: Array1<f64>,
    pub lambda_w: Array1<f64>,
    /// groups x rank
    pub mu_V: Array2<f64>,
    /// groups x rank
    pub lambda_V: Array2<f64>,
}

impl HyperSample {
    pub fn n_groups(&self) -> usize {
        self.mu_w.len()
    }
}

/// A named scalar loss reported on held-out data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub value: f64,
}
