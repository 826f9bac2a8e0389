//! Events-plus-aggregates to scaled feature vectors.
//!
//! Column order is signal fields first, then aggregate columns in window
//! config order. Standardization is fit once over the whole dataset and the
//! resulting [`ScalingParams`] are carried explicitly so later scoring reuses
//! them instead of refitting.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::records::{DatasetSchema, FlightEvent};
use crate::rolling::AggregateTable;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_LABEL_THRESHOLD_MINUTES: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureSource {
    Signal,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub source: FeatureSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub event_time_ms_utc: i64,
    /// Scaled values in schema column order.
    pub values: Vec<f64>,
    pub label: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub label_threshold_minutes: f64,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            label_threshold_minutes: DEFAULT_LABEL_THRESHOLD_MINUTES,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), FeatureError> {
        if !self.label_threshold_minutes.is_finite() {
            return Err(FeatureError::InvalidConfig(
                "label_threshold_minutes must be finite".to_string(),
            ));
        }

        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(FeatureError::InvalidConfig(format!(
                "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
            )));
        }

        Ok(())
    }
}

/// Per-column mean and sample standard deviation, tied to one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingParams {
    pub fingerprint: String,
    pub means: Vec<f64>,
    pub stddevs: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    pub scaling: ScalingParams,
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("feature builder requires at least one event")]
    EmptyInput,
    #[error("missing value for column '{column}' at row {row}")]
    MissingValue { row: usize, column: String },
    #[error("row {row} has {found} signal values, expected {expected}")]
    SignalWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("aggregate column '{column}' has {found} values, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("feature vector has {found} values, schema expects {expected}")]
    VectorWidth { expected: usize, found: usize },
    #[error("duplicate feature column name: {0}")]
    DuplicateColumn(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

impl ScalingParams {
    /// Fits mean and sample standard deviation per column over `raw`.
    ///
    /// Fewer than two rows leaves every standard deviation at 0.
    pub fn fit(schema: &FeatureSchema, raw: &[Vec<f64>]) -> Result<Self, FeatureError> {
        let width = schema.columns.len();
        for (row, values) in raw.iter().enumerate() {
            check_vector(schema, row, values)?;
        }

        let n = raw.len();
        let mut means = vec![0.0; width];
        let mut stddevs = vec![0.0; width];
        if n == 0 {
            return Ok(Self {
                fingerprint: schema.fingerprint.clone(),
                means,
                stddevs,
            });
        }

        for values in raw {
            for (sum, value) in means.iter_mut().zip(values) {
                *sum += value;
            }
        }
        for mean in &mut means {
            *mean /= n as f64;
        }

        if n > 1 {
            for values in raw {
                for ((acc, value), mean) in stddevs.iter_mut().zip(values).zip(&means) {
                    let d = value - mean;
                    *acc += d * d;
                }
            }
            for acc in &mut stddevs {
                *acc = (*acc / (n - 1) as f64).sqrt();
            }
        }

        let constant: Vec<&str> = schema
            .columns
            .iter()
            .zip(&stddevs)
            .filter(|(_, sd)| **sd == 0.0)
            .map(|(column, _)| column.name.as_str())
            .collect();
        if !constant.is_empty() {
            warn!(
                component = "features",
                event = "features.scaling.zero_variance",
                columns = ?constant
            );
        }

        Ok(Self {
            fingerprint: schema.fingerprint.clone(),
            means,
            stddevs,
        })
    }

    pub fn scale_value(&self, column: usize, value: f64) -> f64 {
        let sd = self.stddevs[column];
        if sd == 0.0 {
            0.0
        } else {
            (value - self.means[column]) / sd
        }
    }

    /// Scales one raw vector with the fitted parameters. Never refits.
    pub fn apply(&self, schema: &FeatureSchema, raw: &[f64]) -> Result<Vec<f64>, FeatureError> {
        if self.fingerprint != schema.fingerprint {
            return Err(FeatureError::SchemaFingerprintMismatch {
                expected: self.fingerprint.clone(),
                actual: schema.fingerprint.clone(),
            });
        }
        if raw.len() != self.means.len() {
            return Err(FeatureError::VectorWidth {
                expected: self.means.len(),
                found: raw.len(),
            });
        }
        if self.stddevs.len() != self.means.len() {
            return Err(FeatureError::VectorWidth {
                expected: self.means.len(),
                found: self.stddevs.len(),
            });
        }
        Ok(raw
            .iter()
            .enumerate()
            .map(|(column, value)| self.scale_value(column, *value))
            .collect())
    }
}

pub fn build_feature_schema(
    dataset: &DatasetSchema,
    aggregate_names: &[String],
    cfg: &FeatureConfig,
) -> Result<FeatureSchema, FeatureError> {
    cfg.validate()?;

    let mut columns = Vec::with_capacity(dataset.signal_fields.len() + aggregate_names.len());
    for name in &dataset.signal_fields {
        columns.push(FeatureColumn {
            name: name.clone(),
            source: FeatureSource::Signal,
        });
    }
    for name in aggregate_names {
        columns.push(FeatureColumn {
            name: name.clone(),
            source: FeatureSource::Aggregate,
        });
    }

    let mut seen = HashSet::new();
    for column in &columns {
        if !seen.insert(column.name.as_str()) {
            return Err(FeatureError::DuplicateColumn(column.name.clone()));
        }
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    Ok(FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    })
}

/// Concatenates signals and aggregates per event, unscaled.
pub fn assemble_vectors(
    events: &[FlightEvent],
    schema: &FeatureSchema,
    aggregates: &AggregateTable,
) -> Result<Vec<Vec<f64>>, FeatureError> {
    let signal_width = schema
        .columns
        .iter()
        .filter(|column| column.source == FeatureSource::Signal)
        .count();

    let mut aggregate_columns = Vec::new();
    for column in schema
        .columns
        .iter()
        .filter(|column| column.source == FeatureSource::Aggregate)
    {
        let found = aggregates.column(&column.name).ok_or_else(|| FeatureError::ColumnLength {
            column: column.name.clone(),
            expected: events.len(),
            found: 0,
        })?;
        if found.values.len() != events.len() {
            return Err(FeatureError::ColumnLength {
                column: column.name.clone(),
                expected: events.len(),
                found: found.values.len(),
            });
        }
        aggregate_columns.push(&found.values);
    }

    let mut out = Vec::with_capacity(events.len());
    for (row, event) in events.iter().enumerate() {
        if event.signals.len() != signal_width {
            return Err(FeatureError::SignalWidth {
                row,
                expected: signal_width,
                found: event.signals.len(),
            });
        }
        let mut values = Vec::with_capacity(schema.columns.len());
        values.extend_from_slice(&event.signals);
        values.extend(aggregate_columns.iter().map(|column| column[row]));
        check_vector(schema, row, &values)?;
        out.push(values);
    }
    Ok(out)
}

pub fn label_for(outcome_minutes: f64, threshold_minutes: f64) -> u8 {
    if outcome_minutes >= threshold_minutes {
        1
    } else {
        0
    }
}

/// Builds the schema, fits scaling over every event and emits scaled rows.
pub fn build_features(
    events: &[FlightEvent],
    dataset: &DatasetSchema,
    aggregates: &AggregateTable,
    cfg: &FeatureConfig,
) -> Result<FeatureSet, FeatureError> {
    if events.is_empty() {
        return Err(FeatureError::EmptyInput);
    }

    let schema = build_feature_schema(dataset, &aggregates.names(), cfg)?;
    let raw = assemble_vectors(events, &schema, aggregates)?;
    let scaling = ScalingParams::fit(&schema, &raw)?;
    let rows = scale_rows(events, &schema, &scaling, raw, cfg)?;

    let positives = rows.iter().filter(|row| row.label == 1).count();
    info!(
        component = "features",
        event = "features.build.finish",
        rows = rows.len(),
        positives = positives,
        column_count = schema.columns.len()
    );

    Ok(FeatureSet {
        schema,
        rows,
        scaling,
    })
}

/// Scores new events with previously fitted parameters.
pub fn transform_with_scaling(
    events: &[FlightEvent],
    schema: &FeatureSchema,
    aggregates: &AggregateTable,
    scaling: &ScalingParams,
    cfg: &FeatureConfig,
) -> Result<Vec<FeatureRow>, FeatureError> {
    cfg.validate()?;
    let raw = assemble_vectors(events, schema, aggregates)?;
    scale_rows(events, schema, scaling, raw, cfg)
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn scale_rows(
    events: &[FlightEvent],
    schema: &FeatureSchema,
    scaling: &ScalingParams,
    raw: Vec<Vec<f64>>,
    cfg: &FeatureConfig,
) -> Result<Vec<FeatureRow>, FeatureError> {
    events
        .iter()
        .zip(raw)
        .map(|(event, values)| -> Result<FeatureRow, FeatureError> {
            Ok(FeatureRow {
                event_time_ms_utc: event.event_time_ms_utc,
                values: scaling.apply(schema, &values)?,
                label: label_for(event.outcome_minutes, cfg.label_threshold_minutes),
            })
        })
        .collect()
}

fn check_vector(schema: &FeatureSchema, row: usize, values: &[f64]) -> Result<(), FeatureError> {
    if values.len() != schema.columns.len() {
        return Err(FeatureError::VectorWidth {
            expected: schema.columns.len(),
            found: values.len(),
        });
    }
    if let Some(column) = values.iter().position(|value| !value.is_finite()) {
        return Err(FeatureError::MissingValue {
            row,
            column: schema.columns[column].name.clone(),
        });
    }
    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!(
        "label_threshold_minutes:{};",
        cfg.label_threshold_minutes
    ));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        match column.source {
            FeatureSource::Signal => hasher.update(":signal;"),
            FeatureSource::Aggregate => hasher.update(":aggregate;"),
        }
    }
    hex::encode(hasher.finalize())
}
