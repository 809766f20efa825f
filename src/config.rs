use crate::estimate::FmError;
use crate::types::{PriorConfig, TaskType};
use serde::{Deserialize, Serialize};

/// Assignment of flattened feature columns to prior groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupSpec {
    /// Every one of `dim` columns shares group 0.
    Identical { dim: usize },
    /// `index[i]` is the group of column `i`; labels cover `0..n_groups`.
    Explicit { index: Vec<usize>, n_groups: usize },
}

impl GroupSpec {
    /// Validates an explicit labelling. Labels must be exactly `0..G` for
    /// some `G`; gaps would leave groups without any column.
    pub fn explicit(index: Vec<usize>) -> Result<Self, FmError> {
        let mut labels = index.clone();
        labels.sort_unstable();
        labels.dedup();
        let n_groups = labels.len();
        if let Some(&max) = labels.last()
            && max >= n_groups
        {
            return Err(FmError::InvalidGroupLabels(format!(
                "{n_groups} distinct labels but the largest is {max}; labels must be contiguous from 0"
            )));
        }
        Ok(Self::Explicit { index, n_groups })
    }

    pub fn n_groups(&self) -> usize {
        match self {
            Self::Identical { .. } => 1,
            Self::Explicit { n_groups, .. } => *n_groups,
        }
    }

    /// Number of columns covered.
    pub fn dim(&self) -> usize {
        match self {
            Self::Identical { dim } => *dim,
            Self::Explicit { index, .. } => index.len(),
        }
    }

    pub fn group_of(&self, column: usize) -> usize {
        match self {
            Self::Identical { .. } => 0,
            Self::Explicit { index, .. } => index[column],
        }
    }

    /// Columns of each group, in column order.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_groups()];
        for column in 0..self.dim() {
            members[self.group_of(column)].push(column);
        }
        members
    }
}

/// Immutable sampler configuration. Only constructible through
/// [`ConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    priors: PriorConfig,
    task_type: TaskType,
    n_iter: usize,
    n_kept_samples: usize,
    groups: GroupSpec,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn priors(&self) -> &PriorConfig {
        &self.priors
    }

    pub fn alpha_0(&self) -> f64 {
        self.priors.alpha_0
    }

    pub fn beta_0(&self) -> f64 {
        self.priors.beta_0
    }

    pub fn gamma_0(&self) -> f64 {
        self.priors.gamma_0
    }

    pub fn mu_0(&self) -> f64 {
        self.priors.mu_0
    }

    pub fn reg_0(&self) -> f64 {
        self.priors.reg_0
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    pub fn n_kept_samples(&self) -> usize {
        self.n_kept_samples
    }

    pub fn groups(&self) -> &GroupSpec {
        &self.groups
    }

    /// First 0-based iteration whose draw is kept.
    pub fn first_kept_iteration(&self) -> usize {
        self.n_iter - self.n_kept_samples
    }

    pub fn is_kept_iteration(&self, iteration: usize) -> bool {
        iteration >= self.first_kept_iteration()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    priors: PriorConfig,
    task_type: TaskType,
    n_iter: usize,
    n_kept_samples: Option<usize>,
    groups: Option<GroupSpec>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            priors: PriorConfig::default(),
            task_type: TaskType::Regression,
            n_iter: 100,
            n_kept_samples: None,
            groups: None,
        }
    }
}

impl ConfigBuilder {
    pub fn priors(mut self, priors: PriorConfig) -> Self {
        self.priors = priors;
        self
    }

    pub fn alpha_0(mut self, value: f64) -> Self {
        self.priors.alpha_0 = value;
        self
    }

    pub fn beta_0(mut self, value: f64) -> Self {
        self.priors.beta_0 = value;
        self
    }

    pub fn gamma_0(mut self, value: f64) -> Self {
        self.priors.gamma_0 = value;
        self
    }

    pub fn mu_0(mut self, value: f64) -> Self {
        self.priors.mu_0 = value;
        self
    }

    pub fn reg_0(mut self, value: f64) -> Self {
        self.priors.reg_0 = value;
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    /// Unset means `n_iter - 10`.
    pub fn n_kept_samples(mut self, n_kept_samples: usize) -> Self {
        self.n_kept_samples = Some(n_kept_samples);
        self
    }

    pub fn identical_groups(mut self, dim: usize) -> Self {
        self.groups = Some(GroupSpec::Identical { dim });
        self
    }

    pub fn group_index(mut self, index: Vec<usize>) -> Result<Self, FmError> {
        self.groups = Some(GroupSpec::explicit(index)?);
        Ok(self)
    }

    /// An already validated group structure, as produced by
    /// [`resolve_groups`].
    pub fn groups(mut self, groups: GroupSpec) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn build(self) -> Result<Config, FmError> {
        let n_kept_samples = match self.n_kept_samples {
            Some(kept) if kept > self.n_iter => {
                return Err(FmError::KeptSamplesExceedIterations {
                    n_kept_samples: kept,
                    n_iter: self.n_iter,
                });
            }
            Some(kept) => kept,
            None if self.n_iter > 10 => self.n_iter - 10,
            None => {
                return Err(FmError::InvalidInput(format!(
                    "n_iter = {} leaves no samples after the default 10 burn-in iterations; set n_kept_samples explicitly",
                    self.n_iter
                )));
            }
        };
        let groups = self.groups.ok_or_else(|| {
            FmError::InvalidInput("group structure must be set before building".to_string())
        })?;
        validate_priors(&self.priors)?;
        Ok(Config {
            priors: self.priors,
            task_type: self.task_type,
            n_iter: self.n_iter,
            n_kept_samples,
            groups,
        })
    }
}

fn validate_priors(priors: &PriorConfig) -> Result<(), FmError> {
    let positive = [
        ("alpha_0", priors.alpha_0),
        ("beta_0", priors.beta_0),
        ("gamma_0", priors.gamma_0),
        ("reg_0", priors.reg_0),
    ];
    for (name, value) in positive {
        if !(value.is_finite() && value > 0.0) {
            return Err(FmError::InvalidInput(format!(
                "{name} must be finite and positive, got {value}"
            )));
        }
    }
    if !priors.mu_0.is_finite() {
        return Err(FmError::InvalidInput(format!(
            "mu_0 must be finite, got {}",
            priors.mu_0
        )));
    }
    Ok(())
}

/// Group structure for a fit over `n_explicit` explicit columns and
/// relational blocks of the given widths.
///
/// Without labels every flattened column shares one group. With labels, the
/// labels cover the explicit columns and each relational block's columns
/// form one further group.
pub fn resolve_groups(
    grouping: Option<&[usize]>,
    n_explicit: usize,
    relation_widths: &[usize],
) -> Result<GroupSpec, FmError> {
    let Some(labels) = grouping else {
        let dim = n_explicit + relation_widths.iter().sum::<usize>();
        return Ok(GroupSpec::Identical { dim });
    };
    if labels.len() != n_explicit {
        return Err(FmError::GroupingLengthMismatch {
            expected: n_explicit,
            found: labels.len(),
        });
    }
    let explicit = GroupSpec::explicit(labels.to_vec())?;
    if relation_widths.is_empty() {
        return Ok(explicit);
    }
    let mut index = labels.to_vec();
    let mut next_group = explicit.n_groups();
    for &width in relation_widths {
        index.extend(std::iter::repeat_n(next_group, width));
        next_group += 1;
    }
    GroupSpec::explicit(index)
}
