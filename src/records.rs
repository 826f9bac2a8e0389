//! Flight event records and CSV loading.
//!
//! Each input row is one scheduled departure. Rows with an empty or
//! unparseable required field are dropped and counted; everything that
//! survives is returned sorted by scheduled departure time.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionAxis {
    TailNumber,
    Carrier,
    Origin,
}

impl PartitionAxis {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TailNumber => "tail_number",
            Self::Carrier => "carrier",
            Self::Origin => "origin",
        }
    }

    pub fn key(self, event: &FlightEvent) -> &str {
        match self {
            Self::TailNumber => &event.tail_number,
            Self::Carrier => &event.carrier,
            Self::Origin => &event.origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightEvent {
    pub event_time_ms_utc: i64,
    pub tail_number: String,
    pub carrier: String,
    pub origin: String,
    /// Values in `DatasetSchema::signal_fields` order.
    pub signals: Vec<f64>,
    pub outcome_minutes: f64,
}

/// Column names of the input table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSchema {
    pub time_column: String,
    pub tail_number_column: String,
    pub carrier_column: String,
    pub origin_column: String,
    pub outcome_column: String,
    pub signal_fields: Vec<String>,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            time_column: "sched_depart_date_time_UTC".to_string(),
            tail_number_column: "TAIL_NUM".to_string(),
            carrier_column: "OP_UNIQUE_CARRIER".to_string(),
            origin_column: "ORIGIN".to_string(),
            outcome_column: "DEP_DELAY".to_string(),
            signal_fields: vec![
                "origin_DailySnowfall".to_string(),
                "origin_6Hr_Precipitation".to_string(),
                "origin_12Hr_Precipitation".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub input_rows: u64,
    pub loaded_rows: u64,
    pub dropped_rows: u64,
    pub first_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("input is missing required column '{0}'")]
    MissingColumn(String),
    #[error("column '{0}' is selected more than once")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone)]
struct ColumnIndex {
    time: usize,
    tail_number: usize,
    carrier: usize,
    origin: usize,
    outcome: usize,
    signals: Vec<usize>,
}

pub fn load_events_csv(
    path: &Path,
    schema: &DatasetSchema,
) -> Result<(Vec<FlightEvent>, LoadReport), LoadError> {
    info!(
        component = "records",
        event = "records.load.start",
        path = %path.display(),
        signal_fields = ?schema.signal_fields
    );
    let file = File::open(path)?;
    read_events(file, schema)
}

pub fn read_events<R: Read>(
    reader: R,
    schema: &DatasetSchema,
) -> Result<(Vec<FlightEvent>, LoadReport), LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let columns = resolve_columns(&headers, schema)?;

    let mut report = LoadReport::default();
    let mut events = Vec::new();
    for record in reader.records() {
        let record = record?;
        report.input_rows += 1;
        match parse_event(&record, &columns) {
            Ok(event) => events.push(event),
            Err(reason) => {
                report.dropped_rows += 1;
                if report.first_error.is_none() {
                    report.first_error = Some(format!("row {}: {reason}", report.input_rows));
                }
            }
        }
    }

    events.sort_by_key(|event| event.event_time_ms_utc);
    report.loaded_rows = events.len() as u64;

    if report.dropped_rows > 0 {
        warn!(
            component = "records",
            event = "records.load.rows_dropped",
            dropped_rows = report.dropped_rows,
            first_error = report.first_error.as_deref().unwrap_or_default()
        );
    }
    info!(
        component = "records",
        event = "records.load.finish",
        input_rows = report.input_rows,
        loaded_rows = report.loaded_rows,
        dropped_rows = report.dropped_rows
    );

    Ok((events, report))
}

/// Parses a scheduled departure timestamp into UTC milliseconds.
///
/// Accepts RFC 3339 with an explicit offset, or a naive date-time that is
/// taken to already be in UTC.
pub fn parse_event_time(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NAIVE_TIMESTAMP_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|naive| naive.and_utc().timestamp_millis())
    })
}

fn resolve_columns(headers: &StringRecord, schema: &DatasetSchema) -> Result<ColumnIndex, LoadError> {
    let mut by_name: HashMap<&str, usize> = HashMap::new();
    for (idx, name) in headers.iter().enumerate() {
        by_name.entry(name).or_insert(idx);
    }

    let mut selected = vec![
        schema.time_column.as_str(),
        schema.tail_number_column.as_str(),
        schema.carrier_column.as_str(),
        schema.origin_column.as_str(),
        schema.outcome_column.as_str(),
    ];
    selected.extend(schema.signal_fields.iter().map(String::as_str));
    let mut seen = HashSet::new();
    for name in &selected {
        if !seen.insert(*name) {
            return Err(LoadError::DuplicateColumn((*name).to_string()));
        }
    }

    Ok(ColumnIndex {
        time: column_position(&by_name, &schema.time_column)?,
        tail_number: column_position(&by_name, &schema.tail_number_column)?,
        carrier: column_position(&by_name, &schema.carrier_column)?,
        origin: column_position(&by_name, &schema.origin_column)?,
        outcome: column_position(&by_name, &schema.outcome_column)?,
        signals: schema
            .signal_fields
            .iter()
            .map(|name| column_position(&by_name, name))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

fn column_position(by_name: &HashMap<&str, usize>, name: &str) -> Result<usize, LoadError> {
    by_name
        .get(name)
        .copied()
        .ok_or_else(|| LoadError::MissingColumn(name.to_string()))
}

fn parse_event(record: &StringRecord, columns: &ColumnIndex) -> Result<FlightEvent, String> {
    let raw_time = required_field(record, columns.time, "event time")?;
    let event_time_ms_utc =
        parse_event_time(raw_time).ok_or_else(|| format!("unparseable timestamp '{raw_time}'"))?;

    let signals = columns
        .signals
        .iter()
        .map(|idx| parse_number(record, *idx, "signal"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FlightEvent {
        event_time_ms_utc,
        tail_number: required_field(record, columns.tail_number, "tail number")?.to_string(),
        carrier: required_field(record, columns.carrier, "carrier")?.to_string(),
        origin: required_field(record, columns.origin, "origin")?.to_string(),
        signals,
        outcome_minutes: parse_number(record, columns.outcome, "outcome")?,
    })
}

fn required_field<'a>(
    record: &'a StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<&'a str, String> {
    match record.get(idx) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(format!("missing {field} at column {idx}")),
    }
}

fn parse_number(record: &StringRecord, idx: usize, field: &'static str) -> Result<f64, String> {
    let raw = required_field(record, idx, field)?;
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(format!("unparseable {field} value '{raw}' at column {idx}")),
    }
}
