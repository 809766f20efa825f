use crate::estimate::FmError;
use crate::probability::normal_cdf;
use crate::types::{Metric, TaskType};
use ndarray::{Array1, ArrayView1, Zip};

/// Everything that differs between regression and classification.
///
/// The set of tasks is closed, so each variant is a plain record of
/// function pointers picked at construction.
#[derive(Clone, Copy)]
pub struct TaskStrategy {
    pub task_type: TaskType,
    /// Maps a raw (posterior-mean) score to the prediction scale.
    pub link: fn(f64) -> f64,
    /// Maps user targets to the values the sampler fits.
    pub encode_target: fn(ArrayView1<'_, f64>) -> Result<Array1<f64>, FmError>,
    /// Held-out loss of linked predictions against encoded targets.
    pub loss: fn(ArrayView1<'_, f64>, ArrayView1<'_, f64>) -> Metric,
}

impl std::fmt::Debug for TaskStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStrategy")
            .field("task_type", &self.task_type)
            .finish_non_exhaustive()
    }
}

impl TaskStrategy {
    pub const REGRESSION: Self = Self {
        task_type: TaskType::Regression,
        link: identity,
        encode_target: encode_real_target,
        loss: rmse,
    };

    pub const CLASSIFICATION: Self = Self {
        task_type: TaskType::Classification,
        link: normal_cdf,
        encode_target: encode_binary_target,
        loss: mean_log_loss,
    };

    pub fn for_task(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Regression => Self::REGRESSION,
            TaskType::Classification => Self::CLASSIFICATION,
        }
    }

    pub fn apply_link(&self, scores: Array1<f64>) -> Array1<f64> {
        scores.mapv_into(self.link)
    }
}

fn identity(score: f64) -> f64 {
    score
}

fn encode_real_target(y: ArrayView1<'_, f64>) -> Result<Array1<f64>, FmError> {
    if let Some(i) = y.iter().position(|v| !v.is_finite()) {
        return Err(FmError::InvalidInput(format!(
            "target at index {i} is not finite: {}",
            y[i]
        )));
    }
    Ok(y.to_owned())
}

/// `{0, 1}` labels to `{-1, +1}`. Anything else is rejected rather than
/// thresholded.
fn encode_binary_target(y: ArrayView1<'_, f64>) -> Result<Array1<f64>, FmError> {
    if let Some(i) = y.iter().position(|&v| v != 0.0 && v != 1.0) {
        return Err(FmError::InvalidInput(format!(
            "classification labels must be 0 or 1, found {} at index {i}",
            y[i]
        )));
    }
    Ok(y.mapv(|v| 2.0 * v - 1.0))
}

/// Root mean squared error.
pub fn rmse(prediction: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> Metric {
    let n = prediction.len().max(1) as f64;
    let sse = Zip::from(&prediction)
        .and(&y)
        .fold(0.0, |acc, &p, &t| acc + (t - p) * (t - p));
    Metric {
        name: "rmse",
        value: (sse / n).sqrt(),
    }
}

/// Mean negative log-likelihood of probabilities against `±1` targets.
/// Probabilities are offset by 1e-15 so an exact 0 or 1 stays finite.
pub fn mean_log_loss(probability: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> Metric {
    const EPS: f64 = 1e-15;
    let n = probability.len().max(1) as f64;
    let total = Zip::from(&probability).and(&y).fold(0.0, |acc, &p, &t| {
        if t > 0.0 {
            acc - (p + EPS).ln()
        } else {
            acc - (1.0 - p + EPS).ln()
        }
    });
    Metric {
        name: "ll",
        value: total / n,
    }
}

#[cfg(test)]
mod tests {
    use super::{TaskStrategy, mean_log_loss, rmse};
    use crate::types::TaskType;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn regression_is_identity_on_scores_and_targets() {
        let s = TaskStrategy::for_task(TaskType::Regression);
        assert_eq!(s.apply_link(array![-2.0, 3.5]), array![-2.0, 3.5]);
        assert_eq!((s.encode_target)(array![0.3, 7.0].view()).unwrap(), array![0.3, 7.0]);
        assert!((s.encode_target)(array![f64::NAN].view()).is_err());
    }

    #[test]
    fn classification_encodes_labels_to_signs() {
        let s = TaskStrategy::CLASSIFICATION;
        let encoded = (s.encode_target)(array![0.0, 1.0, 1.0].view()).unwrap();
        assert_eq!(encoded, array![-1.0, 1.0, 1.0]);
        assert!((s.encode_target)(array![0.0, 2.0].view()).is_err());
    }

    #[test]
    fn classification_link_thresholds_by_score_sign() {
        let s = TaskStrategy::CLASSIFICATION;
        let probs = s.apply_link(array![-0.7, 0.0, 0.7]);
        assert!(probs[0] < 0.5);
        assert_abs_diff_eq!(probs[1], 0.5, epsilon = 1e-15);
        assert!(probs[2] > 0.5);
        assert_abs_diff_eq!(probs[0] + probs[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rmse_reference() {
        let m = rmse(array![1.0, 2.0, 3.0].view(), array![1.0, 0.0, 5.0].view());
        assert_eq!(m.name, "rmse");
        assert_abs_diff_eq!(m.value, (8.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn log_loss_stays_finite_at_certainty() {
        let m = mean_log_loss(array![1.0, 0.0].view(), array![-1.0, 1.0].view());
        assert_eq!(m.name, "ll");
        assert!(m.value.is_finite());
        assert_abs_diff_eq!(m.value, -(1e-15_f64).ln(), epsilon = 1e-6);

        let m = mean_log_loss(array![0.8, 0.25].view(), array![1.0, -1.0].view());
        assert_abs_diff_eq!(m.value, -(0.8_f64.ln() + 0.75_f64.ln()) / 2.0, epsilon = 1e-12);
    }
}
