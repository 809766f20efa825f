#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod config;
pub mod driver;
pub mod estimate;
pub mod features;
pub mod gibbs;
pub mod matrix;
pub mod probability;
pub mod sampler;
pub mod scoring;
pub mod task;
pub mod trace;
pub mod types;
pub mod visualizer;

pub use config::{Config, ConfigBuilder, GroupSpec, resolve_groups};
pub use driver::{EvaluationReport, TrainingDriver};
pub use estimate::{FactorizationMachine, FitOptions, FmClassifier, FmError, FmRegressor};
pub use features::{AssembledFeatures, assemble};
pub use gibbs::GibbsSampler;
pub use matrix::{FeatureMatrix, RelationBlock, flatten};
pub use sampler::{IterationCallback, PosteriorDraws, Sampler, SamplerError, SamplerInput};
pub use scoring::{ScoringInput, score_mean, score_point};
pub use task::TaskStrategy;
pub use trace::{HyperTrace, PosteriorStore, TraceView, trace_columns};
pub use types::{
    FmHyperParams, FmSample, HyperSample, Metric, PriorConfig, TaskType, TrainingState,
};
