//! Classifier seam and an L1-regularized logistic regression.
//!
//! The pipeline only sees [`Classifier`] and [`TrainedModel`]. The positive
//! class probability travels in a named field of [`Prediction`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::FeatureRow;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub event_time_ms_utc: i64,
    pub probability_positive: f64,
    pub label: u8,
}

#[derive(Debug, Error, PartialEq)]
pub enum TrainError {
    #[error("invalid classifier config: {0}")]
    InvalidConfig(String),
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("training row {row} has {found} features, expected {expected}")]
    InconsistentWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("training diverged at iteration {iteration}")]
    Diverged { iteration: usize },
}

pub trait TrainedModel: Send + Sync {
    fn probability_positive(&self, values: &[f64]) -> f64;

    fn coefficients(&self) -> &[f64];

    fn intercept(&self) -> f64;

    fn predict(&self, row: &FeatureRow) -> Prediction {
        Prediction {
            event_time_ms_utc: row.event_time_ms_utc,
            probability_positive: self.probability_positive(&row.values),
            label: row.label,
        }
    }
}

pub trait Classifier: Sync {
    type Model: TrainedModel;

    fn fit(&self, rows: &[&FeatureRow]) -> Result<Self::Model, TrainError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticRegressionConfig {
    /// L1 penalty strength.
    pub reg_param: f64,
    pub max_iter: usize,
    pub learning_rate: f64,
    /// Stop once no parameter moves by more than this.
    pub tolerance: f64,
}

impl Default for LogisticRegressionConfig {
    fn default() -> Self {
        Self {
            reg_param: 0.01,
            max_iter: 100,
            learning_rate: 0.5,
            tolerance: 1e-6,
        }
    }
}

impl LogisticRegressionConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        if !self.reg_param.is_finite() || self.reg_param < 0.0 {
            return Err(TrainError::InvalidConfig(
                "reg_param must be finite and >= 0".to_string(),
            ));
        }
        if self.max_iter == 0 {
            return Err(TrainError::InvalidConfig(
                "max_iter must be > 0".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainError::InvalidConfig(
                "learning_rate must be finite and > 0".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(TrainError::InvalidConfig(
                "tolerance must be finite and >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Full-batch proximal gradient descent on the mean log-loss. The intercept
/// is not penalized.
#[derive(Debug, Clone, Default)]
pub struct LogisticRegression {
    pub config: LogisticRegressionConfig,
}

impl LogisticRegression {
    pub fn new(config: LogisticRegressionConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub iterations: usize,
}

impl TrainedModel for LogisticModel {
    fn probability_positive(&self, values: &[f64]) -> f64 {
        let z = self.intercept
            + self
                .coefficients
                .iter()
                .zip(values)
                .map(|(w, x)| w * x)
                .sum::<f64>();
        sigmoid(z)
    }

    fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Classifier for LogisticRegression {
    type Model = LogisticModel;

    fn fit(&self, rows: &[&FeatureRow]) -> Result<LogisticModel, TrainError> {
        self.config.validate()?;
        let first = rows.first().ok_or(TrainError::EmptyTrainingSet)?;
        let width = first.values.len();
        for (row, sample) in rows.iter().enumerate() {
            if sample.values.len() != width {
                return Err(TrainError::InconsistentWidth {
                    row,
                    expected: width,
                    found: sample.values.len(),
                });
            }
        }

        let n = rows.len() as f64;
        let step = self.config.learning_rate;
        let shrink = step * self.config.reg_param;
        let mut weights = vec![0.0; width];
        let mut intercept = 0.0;
        let mut grad = vec![0.0; width];
        let mut iterations = 0;

        for iteration in 1..=self.config.max_iter {
            iterations = iteration;
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_intercept = 0.0;

            for sample in rows {
                let z = intercept
                    + weights
                        .iter()
                        .zip(&sample.values)
                        .map(|(w, x)| w * x)
                        .sum::<f64>();
                let residual = sigmoid(z) - f64::from(sample.label);
                grad_intercept += residual;
                for (g, x) in grad.iter_mut().zip(&sample.values) {
                    *g += residual * x;
                }
            }

            let mut max_delta = 0.0_f64;
            for (w, g) in weights.iter_mut().zip(&grad) {
                let updated = soft_threshold(*w - step * g / n, shrink);
                max_delta = max_delta.max((updated - *w).abs());
                *w = updated;
            }
            let updated_intercept = intercept - step * grad_intercept / n;
            max_delta = max_delta.max((updated_intercept - intercept).abs());
            intercept = updated_intercept;

            if !intercept.is_finite() || weights.iter().any(|w| !w.is_finite()) {
                return Err(TrainError::Diverged { iteration });
            }
            if max_delta <= self.config.tolerance {
                debug!(
                    component = "model",
                    event = "model.fit.converged",
                    iteration = iteration,
                    max_delta = max_delta
                );
                break;
            }
        }

        info!(
            component = "model",
            event = "model.fit.finish",
            rows = rows.len(),
            features = width,
            iterations = iterations,
            nonzero_coefficients = weights.iter().filter(|w| **w != 0.0).count()
        );

        Ok(LogisticModel {
            coefficients: weights,
            intercept,
            iterations,
        })
    }
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}
