//! Precision/recall over a sweep of probability cutoffs.
//!
//! A prediction is positive at cutoff `C` when `probability >= C`. Each record
//! is binned once by how many of the sorted cutoffs it clears; a suffix sum
//! over the bins then gives the true and false positive counts for every
//! cutoff. Partial counters from independent passes merge by addition.

use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::Prediction;

pub const DEFAULT_CUTOFFS: [f64; 8] = [0.0, 0.15, 0.20, 0.25, 0.30, 0.40, 0.60, 0.80];

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("at least one cutoff is required")]
    NoCutoffs,
    #[error("cutoff {value} at position {index} is not finite")]
    NonFiniteCutoff { index: usize, value: f64 },
    #[error("cutoffs must be sorted ascending: {previous} precedes {value} at position {index}")]
    UnsortedCutoffs {
        index: usize,
        previous: f64,
        value: f64,
    },
    #[error("probability {probability} at record {record} is outside [0, 1]")]
    InvalidProbability { record: usize, probability: f64 },
    #[error("label {label} at record {record} is not 0 or 1")]
    InvalidLabel { record: usize, label: u8 },
    #[error("cannot merge counters built for different cutoffs")]
    CutoffMismatch,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validated, ascending cutoff list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Cutoffs(Vec<f64>);

impl Cutoffs {
    pub fn new(values: Vec<f64>) -> Result<Self, EvalError> {
        if values.is_empty() {
            return Err(EvalError::NoCutoffs);
        }
        for (index, value) in values.iter().copied().enumerate() {
            if !value.is_finite() {
                return Err(EvalError::NonFiniteCutoff { index, value });
            }
            if index > 0 && value < values[index - 1] {
                return Err(EvalError::UnsortedCutoffs {
                    index,
                    previous: values[index - 1],
                    value,
                });
            }
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of cutoffs `C` with `C <= probability`.
    fn cleared(&self, probability: f64) -> usize {
        self.0.partition_point(|cutoff| *cutoff <= probability)
    }
}

impl Default for Cutoffs {
    fn default() -> Self {
        Self(DEFAULT_CUTOFFS.to_vec())
    }
}

impl TryFrom<Vec<f64>> for Cutoffs {
    type Error = EvalError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Cutoffs> for Vec<f64> {
    fn from(cutoffs: Cutoffs) -> Self {
        cutoffs.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoffMetrics {
    pub cutoff: f64,
    pub true_positives: u64,
    pub false_positives: u64,
    /// `None` when nothing clears the cutoff.
    pub precision: Option<f64>,
    /// `None` when the evaluated set has no positives.
    pub recall: Option<f64>,
}

/// Fixed-size counters for one cutoff list.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCounts {
    cutoffs: Cutoffs,
    positive_bins: Vec<u64>,
    negative_bins: Vec<u64>,
    records: u64,
}

impl ThresholdCounts {
    pub fn new(cutoffs: Cutoffs) -> Self {
        let bins = cutoffs.len() + 1;
        Self {
            cutoffs,
            positive_bins: vec![0; bins],
            negative_bins: vec![0; bins],
            records: 0,
        }
    }

    /// Adds one prediction. `record` only labels errors.
    pub fn observe(&mut self, record: usize, prediction: &Prediction) -> Result<(), EvalError> {
        let probability = prediction.probability_positive;
        if !(0.0..=1.0).contains(&probability) {
            return Err(EvalError::InvalidProbability {
                record,
                probability,
            });
        }
        let bin = self.cutoffs.cleared(probability);
        match prediction.label {
            0 => self.negative_bins[bin] += 1,
            1 => self.positive_bins[bin] += 1,
            label => return Err(EvalError::InvalidLabel { record, label }),
        }
        self.records += 1;
        Ok(())
    }

    pub fn observe_all(&mut self, predictions: &[Prediction]) -> Result<(), EvalError> {
        for (record, prediction) in predictions.iter().enumerate() {
            self.observe(record, prediction)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &Self) -> Result<(), EvalError> {
        if self.cutoffs != other.cutoffs {
            return Err(EvalError::CutoffMismatch);
        }
        for (acc, value) in self.positive_bins.iter_mut().zip(&other.positive_bins) {
            *acc += value;
        }
        for (acc, value) in self.negative_bins.iter_mut().zip(&other.negative_bins) {
            *acc += value;
        }
        self.records += other.records;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn positives(&self) -> u64 {
        self.positive_bins.iter().sum()
    }

    pub fn true_positives(&self) -> Vec<u64> {
        at_or_above(&self.positive_bins)
    }

    pub fn false_positives(&self) -> Vec<u64> {
        at_or_above(&self.negative_bins)
    }

    pub fn metrics(&self) -> Vec<CutoffMetrics> {
        let positives = self.positives();
        self.cutoffs
            .as_slice()
            .iter()
            .zip(self.true_positives())
            .zip(self.false_positives())
            .map(|((cutoff, tp), fp)| CutoffMetrics {
                cutoff: *cutoff,
                true_positives: tp,
                false_positives: fp,
                precision: ratio(tp, tp + fp),
                recall: ratio(tp, positives),
            })
            .collect()
    }
}

/// Single-pass sweep over `predictions`.
pub fn evaluate(
    predictions: &[Prediction],
    cutoffs: &Cutoffs,
) -> Result<Vec<CutoffMetrics>, EvalError> {
    let mut counts = ThresholdCounts::new(cutoffs.clone());
    counts.observe_all(predictions)?;
    let metrics = counts.metrics();

    info!(
        component = "evaluate",
        event = "evaluate.sweep.finish",
        records = counts.records(),
        positives = counts.positives(),
        cutoffs = cutoffs.len()
    );

    Ok(metrics)
}

#[derive(Debug, Serialize)]
struct MetricsCsvRow {
    #[serde(rename = "Cutoff")]
    cutoff: f64,
    #[serde(rename = "TP")]
    true_positives: u64,
    #[serde(rename = "FP")]
    false_positives: u64,
    #[serde(rename = "Precision")]
    precision: Option<f64>,
    #[serde(rename = "Recall")]
    recall: Option<f64>,
}

/// Writes `Cutoff,TP,FP,Precision,Recall`; undefined values are empty fields.
pub fn write_metrics_csv<W: Write>(writer: W, metrics: &[CutoffMetrics]) -> Result<(), EvalError> {
    let mut out = csv::Writer::from_writer(writer);
    for metric in metrics {
        out.serialize(MetricsCsvRow {
            cutoff: metric.cutoff,
            true_positives: metric.true_positives,
            false_positives: metric.false_positives,
            precision: metric.precision,
            recall: metric.recall,
        })?;
    }
    out.flush()?;
    Ok(())
}

/// `out[j]` is the number of records in bins strictly above `j`, i.e. those
/// that cleared cutoff `j`.
fn at_or_above(bins: &[u64]) -> Vec<u64> {
    let cutoffs = bins.len().saturating_sub(1);
    let mut out = vec![0; cutoffs];
    let mut running = 0u64;
    for j in (0..cutoffs).rev() {
        running += bins[j + 1];
        out[j] = running;
    }
    out
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}
