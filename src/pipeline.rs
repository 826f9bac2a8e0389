//! Batch run: aggregates, features, chronological blocks, per-block training
//! and the merged threshold sweep.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::dispatcher::{self, Dispatch};
use tracing::{error, info};

use crate::evaluate::{write_metrics_csv, CutoffMetrics, Cutoffs, EvalError, ThresholdCounts};
use crate::features::{
    build_features, FeatureConfig, FeatureError, FeatureRow, FeatureSchema, ScalingParams,
};
use crate::model::{Classifier, LogisticRegressionConfig, Prediction, TrainError, TrainedModel};
use crate::records::{DatasetSchema, FlightEvent, LoadError};
use crate::rolling::{
    aggregate_all, default_window_configs, validate_windows, RollingError, WindowConfig,
};
use crate::split::{assign_ranks, split, BlockBoundaries, BlockSplit, SplitConfig, SplitError};

pub const DEFAULT_SIGNIFICANCE_THRESHOLD: f64 = 0.001;
pub const PRECISION_RECALL_FILE: &str = "precision_recall.csv";
pub const COEFFICIENTS_FILE: &str = "significant_coefficients.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset: DatasetSchema,
    pub windows: Vec<WindowConfig>,
    pub features: FeatureConfig,
    pub split: SplitConfig,
    pub cutoffs: Cutoffs,
    pub classifier: LogisticRegressionConfig,
    /// Coefficients with a larger magnitude are reported.
    pub significance_threshold: f64,
    /// Worker threads for aggregation and block training; 0 uses every core.
    pub threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetSchema::default(),
            windows: default_window_configs(),
            features: FeatureConfig::default(),
            split: SplitConfig::default(),
            cutoffs: Cutoffs::default(),
            classifier: LogisticRegressionConfig::default(),
            significance_threshold: DEFAULT_SIGNIFICANCE_THRESHOLD,
            threads: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("input contains no events")]
    EmptyDataset,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Rolling(#[from] RollingError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("training failed for block {block}: {source}")]
    Training { block: usize, source: TrainError },
    #[error("thread pool error: {0}")]
    ThreadPool(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Checks every parameter before any data is touched.
    pub fn validate(&self) -> Result<(), PipelineError> {
        validate_windows(&self.windows)?;
        self.features.validate()?;
        self.split.validate()?;
        self.classifier
            .validate()
            .map_err(|err| PipelineError::InvalidConfig(err.to_string()))?;

        if self.dataset.signal_fields.is_empty() && self.windows.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one signal field or aggregate window is required".to_string(),
            ));
        }
        if !self.significance_threshold.is_finite() || self.significance_threshold < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "significance_threshold must be finite and >= 0, got {}",
                self.significance_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub boundaries: BlockBoundaries,
    pub train_rows: usize,
    pub test_rows: usize,
    pub test_positives: u64,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub schema: FeatureSchema,
    pub scaling: ScalingParams,
    pub blocks: Vec<BlockSummary>,
    pub evaluated_records: u64,
    pub metrics: Vec<CutoffMetrics>,
    pub significant_coefficients: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub precision_recall: PathBuf,
    pub coefficients: PathBuf,
}

struct BlockRun {
    summary: BlockSummary,
    counts: ThresholdCounts,
}

pub fn run_pipeline<C: Classifier>(
    events: &[FlightEvent],
    cfg: &PipelineConfig,
    classifier: &C,
) -> Result<PipelineOutput, PipelineError> {
    cfg.validate()?;
    if events.is_empty() {
        return Err(PipelineError::EmptyDataset);
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(cfg.threads)
        .build()
        .map_err(|err| PipelineError::ThreadPool(err.to_string()))?;

    info!(
        component = "pipeline",
        event = "pipeline.run.start",
        rows = events.len(),
        windows = cfg.windows.len(),
        num_blocks = cfg.split.num_blocks,
        split_ratio = cfg.split.split_ratio,
        threads = pool.current_num_threads()
    );

    // Pool threads do not inherit a scoped subscriber from the caller.
    let dispatch = dispatcher::get_default(Dispatch::clone);
    pool.install(|| {
        dispatcher::with_default(&dispatch, || run_stages(events, cfg, classifier, &dispatch))
    })
}

fn run_stages<C: Classifier>(
    events: &[FlightEvent],
    cfg: &PipelineConfig,
    classifier: &C,
    dispatch: &Dispatch,
) -> Result<PipelineOutput, PipelineError> {
    let aggregates = aggregate_all(events, &cfg.windows)?;
    let feature_set = build_features(events, &cfg.dataset, &aggregates, &cfg.features)?;

    let times: Vec<i64> = feature_set
        .rows
        .iter()
        .map(|row| row.event_time_ms_utc)
        .collect();
    let ranks = assign_ranks(&times);
    let blocks = split(&ranks, &cfg.split)?;

    let runs = blocks
        .par_iter()
        .map(|block| {
            dispatcher::with_default(dispatch, || {
                run_block(block, &feature_set.rows, classifier, &cfg.cutoffs)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut total = ThresholdCounts::new(cfg.cutoffs.clone());
    for run in &runs {
        total.merge(&run.counts)?;
    }
    let metrics = total.metrics();

    let blocks: Vec<BlockSummary> = runs.into_iter().map(|run| run.summary).collect();
    let significant = blocks
        .first()
        .map(|first| {
            significant_coefficients(
                &feature_set.schema,
                &first.coefficients,
                cfg.significance_threshold,
            )
        })
        .unwrap_or_default();

    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        blocks = blocks.len(),
        evaluated_records = total.records(),
        positives = total.positives(),
        significant_coefficients = significant.len()
    );

    Ok(PipelineOutput {
        schema: feature_set.schema,
        scaling: feature_set.scaling,
        blocks,
        evaluated_records: total.records(),
        metrics,
        significant_coefficients: significant,
    })
}

fn run_block<C: Classifier>(
    block: &BlockSplit,
    rows: &[FeatureRow],
    classifier: &C,
    cutoffs: &Cutoffs,
) -> Result<BlockRun, PipelineError> {
    let index = block.boundaries.index;
    let train: Vec<&FeatureRow> = block.train_indices.iter().map(|&idx| &rows[idx]).collect();

    let model = classifier.fit(&train).map_err(|source| {
        error!(
            component = "pipeline",
            event = "pipeline.block.train_failed",
            block = index,
            train_rows = train.len(),
            error = %source
        );
        PipelineError::Training {
            block: index,
            source,
        }
    })?;

    let predictions: Vec<Prediction> = block
        .test_indices
        .iter()
        .map(|&idx| model.predict(&rows[idx]))
        .collect();

    let mut counts = ThresholdCounts::new(cutoffs.clone());
    counts.observe_all(&predictions)?;

    info!(
        component = "pipeline",
        event = "pipeline.block.finish",
        block = index,
        train_rows = train.len(),
        test_rows = predictions.len(),
        test_positives = counts.positives()
    );

    Ok(BlockRun {
        summary: BlockSummary {
            boundaries: block.boundaries,
            train_rows: train.len(),
            test_rows: predictions.len(),
            test_positives: counts.positives(),
            coefficients: model.coefficients().to_vec(),
            intercept: model.intercept(),
        },
        counts,
    })
}

/// Feature name to coefficient for every coefficient whose magnitude exceeds
/// `threshold`.
pub fn significant_coefficients(
    schema: &FeatureSchema,
    coefficients: &[f64],
    threshold: f64,
) -> BTreeMap<String, f64> {
    schema
        .columns
        .iter()
        .zip(coefficients)
        .filter(|(_, weight)| weight.abs() > threshold)
        .map(|(column, weight)| (column.name.clone(), *weight))
        .collect()
}

pub fn write_artifacts(
    output_dir: &Path,
    output: &PipelineOutput,
) -> Result<ArtifactPaths, PipelineError> {
    fs::create_dir_all(output_dir)?;

    let precision_recall = output_dir.join(PRECISION_RECALL_FILE);
    write_metrics_csv(BufWriter::new(File::create(&precision_recall)?), &output.metrics)?;

    let coefficients = output_dir.join(COEFFICIENTS_FILE);
    serde_json::to_writer_pretty(
        BufWriter::new(File::create(&coefficients)?),
        &output.significant_coefficients,
    )?;

    info!(
        component = "pipeline",
        event = "pipeline.artifacts.written",
        precision_recall = %precision_recall.display(),
        coefficients = %coefficients.display()
    );

    Ok(ArtifactPaths {
        precision_recall,
        coefficients,
    })
}
