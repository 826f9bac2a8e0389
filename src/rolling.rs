//! Trailing-window aggregates over partitioned flight events.
//!
//! For an event at time `t` the window covers the closed interval
//! `[t - window_start, t - window_end]` inside the event's partition. The gap
//! between `t - window_end` and `t` is a blackout: nothing reported inside it
//! may feed the event's aggregate. An empty window yields 0.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::records::{FlightEvent, PartitionAxis};

const SECONDS_TO_MS: i64 = 1_000;
const HOUR_SECONDS: u32 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFn {
    Mean,
    Count,
    /// Outcome of the latest event in the window.
    Last,
}

impl AggregateFn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Count => "count",
            Self::Last => "last",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub name: String,
    pub axis: PartitionAxis,
    pub window_start_secs: u32,
    pub window_end_secs: u32,
    pub agg: AggregateFn,
}

impl WindowConfig {
    pub fn new(
        name: impl Into<String>,
        axis: PartitionAxis,
        window_start_secs: u32,
        window_end_secs: u32,
        agg: AggregateFn,
    ) -> Self {
        Self {
            name: name.into(),
            axis,
            window_start_secs,
            window_end_secs,
            agg,
        }
    }

    pub fn hours(
        name: impl Into<String>,
        axis: PartitionAxis,
        start_hours: u32,
        end_hours: u32,
        agg: AggregateFn,
    ) -> Self {
        Self::new(
            name,
            axis,
            start_hours * HOUR_SECONDS,
            end_hours * HOUR_SECONDS,
            agg,
        )
    }

    fn start_ms(&self) -> i64 {
        i64::from(self.window_start_secs) * SECONDS_TO_MS
    }

    fn end_ms(&self) -> i64 {
        i64::from(self.window_end_secs) * SECONDS_TO_MS
    }
}

/// Previous tail delay over 26h, carrier and airport means over 6h, all with
/// a 2h blackout.
pub fn default_window_configs() -> Vec<WindowConfig> {
    vec![
        WindowConfig::hours(
            "av_airport_delay",
            PartitionAxis::Origin,
            6,
            2,
            AggregateFn::Mean,
        ),
        WindowConfig::hours(
            "prev_delay",
            PartitionAxis::TailNumber,
            26,
            2,
            AggregateFn::Last,
        ),
        WindowConfig::hours(
            "av_carrier_delay",
            PartitionAxis::Carrier,
            6,
            2,
            AggregateFn::Mean,
        ),
        WindowConfig::hours(
            "num_flights",
            PartitionAxis::Carrier,
            6,
            2,
            AggregateFn::Count,
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateColumn {
    pub name: String,
    /// Aligned with the input event slice.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTable {
    pub row_count: usize,
    pub columns: Vec<AggregateColumn>,
}

impl AggregateTable {
    pub fn column(&self, name: &str) -> Option<&AggregateColumn> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RollingError {
    #[error("invalid window config '{name}': {reason}")]
    InvalidWindow { name: String, reason: String },
    #[error("duplicate aggregate column name: {0}")]
    DuplicateColumn(String),
    #[error("rolling aggregation requires at least one event")]
    EmptyInput,
}

pub fn validate_window(window: &WindowConfig) -> Result<(), RollingError> {
    if window.name.trim().is_empty() {
        return Err(RollingError::InvalidWindow {
            name: window.name.clone(),
            reason: "name must not be empty".to_string(),
        });
    }
    if window.window_start_secs <= window.window_end_secs {
        return Err(RollingError::InvalidWindow {
            name: window.name.clone(),
            reason: format!(
                "window_start_secs ({}) must be greater than window_end_secs ({})",
                window.window_start_secs, window.window_end_secs
            ),
        });
    }
    Ok(())
}

pub fn validate_windows(windows: &[WindowConfig]) -> Result<(), RollingError> {
    let mut seen = HashSet::new();
    for window in windows {
        validate_window(window)?;
        if !seen.insert(window.name.as_str()) {
            return Err(RollingError::DuplicateColumn(window.name.clone()));
        }
    }
    Ok(())
}

/// Computes one aggregate value per event, aligned with `events`.
pub fn aggregate(events: &[FlightEvent], window: &WindowConfig) -> Result<Vec<f64>, RollingError> {
    validate_window(window)?;
    if events.is_empty() {
        return Err(RollingError::EmptyInput);
    }

    let partitions = partition_positions(events, window.axis);
    let mut out = vec![0.0; events.len()];
    for positions in &partitions {
        scan_partition(events, positions, window, &mut out);
    }

    debug!(
        component = "rolling",
        event = "rolling.aggregate.column",
        name = %window.name,
        axis = window.axis.as_str(),
        agg = window.agg.as_str(),
        partitions = partitions.len()
    );

    Ok(out)
}

/// Computes every configured column. Columns are independent and are built in
/// parallel.
pub fn aggregate_all(
    events: &[FlightEvent],
    windows: &[WindowConfig],
) -> Result<AggregateTable, RollingError> {
    validate_windows(windows)?;
    if events.is_empty() {
        return Err(RollingError::EmptyInput);
    }

    info!(
        component = "rolling",
        event = "rolling.aggregate.start",
        rows = events.len(),
        columns = windows.len()
    );

    let columns = windows
        .par_iter()
        .map(|window| {
            aggregate(events, window).map(|values| AggregateColumn {
                name: window.name.clone(),
                values,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        component = "rolling",
        event = "rolling.aggregate.finish",
        rows = events.len(),
        columns = columns.len()
    );

    Ok(AggregateTable {
        row_count: events.len(),
        columns,
    })
}

/// Event positions grouped by partition key, each group ordered by
/// `(time, position)`.
fn partition_positions(events: &[FlightEvent], axis: PartitionAxis) -> Vec<Vec<usize>> {
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, event) in events.iter().enumerate() {
        groups.entry(axis.key(event)).or_default().push(idx);
    }

    let mut out: Vec<Vec<usize>> = groups.into_values().collect();
    for positions in &mut out {
        positions.sort_by_key(|&idx| (events[idx].event_time_ms_utc, idx));
    }
    out
}

fn scan_partition(
    events: &[FlightEvent],
    positions: &[usize],
    window: &WindowConfig,
    out: &mut [f64],
) {
    let times: Vec<i64> = positions
        .iter()
        .map(|&idx| events[idx].event_time_ms_utc)
        .collect();

    let mut prefix = Vec::with_capacity(positions.len() + 1);
    prefix.push(0.0_f64);
    let mut running = 0.0_f64;
    for &idx in positions {
        running += events[idx].outcome_minutes;
        prefix.push(running);
    }

    let start_ms = window.start_ms();
    let end_ms = window.end_ms();

    // `lo` is the first member at or after the window start, `hi` the first
    // member past the window end. Both only move forward as `t` grows.
    let mut lo = 0usize;
    let mut hi = 0usize;
    for (pos, &idx) in positions.iter().enumerate() {
        let t = times[pos];
        let earliest = t - start_ms;
        let latest = t - end_ms;
        while lo < times.len() && times[lo] < earliest {
            lo += 1;
        }
        while hi < times.len() && times[hi] <= latest {
            hi += 1;
        }

        let own = events[idx].outcome_minutes;
        let contains_self = lo <= pos && pos < hi;
        let mut count = hi - lo;
        let mut sum = prefix[hi] - prefix[lo];
        if contains_self {
            count -= 1;
            sum -= own;
        }

        out[idx] = match window.agg {
            AggregateFn::Count => count as f64,
            AggregateFn::Mean => {
                if count == 0 {
                    0.0
                } else {
                    sum / count as f64
                }
            }
            AggregateFn::Last => last_member(lo, hi, pos)
                .map(|member| events[positions[member]].outcome_minutes)
                .unwrap_or(0.0),
        };
    }
}

fn last_member(lo: usize, hi: usize, own: usize) -> Option<usize> {
    if hi <= lo {
        return None;
    }
    let candidate = hi - 1;
    if candidate != own {
        return Some(candidate);
    }
    if candidate > lo {
        Some(candidate - 1)
    } else {
        None
    }
}
