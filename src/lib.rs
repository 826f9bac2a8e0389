//! Delaycast core crate.
//!
//! Current implemented scope:
//! - flight event loading from delimited text
//! - causal rolling aggregates per tail number, carrier and origin airport
//! - fixed-order feature vectors with a global standardization fit
//! - chronological train/test block splitting
//! - per-block classifier training and a merged precision/recall sweep

mod evaluate;
mod features;
mod model;
mod observability;
mod pipeline;
mod records;
mod rolling;
mod split;

pub use evaluate::{
    evaluate, write_metrics_csv, CutoffMetrics, Cutoffs, EvalError, ThresholdCounts,
    DEFAULT_CUTOFFS,
};
pub use features::{
    assemble_vectors, assert_schema_compatible, build_feature_schema, build_features, label_for,
    transform_with_scaling, FeatureColumn, FeatureConfig, FeatureError, FeatureRow, FeatureSchema,
    FeatureSet, FeatureSource, ScalingParams, DEFAULT_LABEL_THRESHOLD_MINUTES,
    FEATURE_SCHEMA_VERSION,
};
pub use model::{
    sigmoid, Classifier, LogisticModel, LogisticRegression, LogisticRegressionConfig, Prediction,
    TrainError, TrainedModel,
};
pub use observability::{
    init_logging, log_config_source, log_run_finish, log_run_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError, LOG_FORMAT_VAR, LOG_LEVEL_VAR, LOG_TARGET_VAR,
};
pub use pipeline::{
    run_pipeline, significant_coefficients, write_artifacts, ArtifactPaths, BlockSummary,
    PipelineConfig, PipelineError, PipelineOutput, COEFFICIENTS_FILE,
    DEFAULT_SIGNIFICANCE_THRESHOLD, PRECISION_RECALL_FILE,
};
pub use records::{
    load_events_csv, parse_event_time, read_events, DatasetSchema, FlightEvent, LoadError,
    LoadReport, PartitionAxis,
};
pub use rolling::{
    aggregate, aggregate_all, default_window_configs, validate_window, validate_windows,
    AggregateColumn, AggregateFn, AggregateTable, RollingError, WindowConfig,
};
pub use split::{
    assign_ranks, block_boundaries, split, BlockBoundaries, BlockSplit, RankBounds, SplitConfig,
    SplitError,
};
