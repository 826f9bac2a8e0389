use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use delaycast::{
    aggregate_all, build_features, default_window_configs, evaluate, log_config_source,
    log_run_finish, log_run_start, read_events, run_pipeline, Cutoffs, DatasetSchema,
    FeatureConfig, FlightEvent, LoggingConfig, LogisticRegression, PipelineConfig, Prediction,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn sample_events(count: i64) -> Vec<FlightEvent> {
    (0..count)
        .map(|i| FlightEvent {
            event_time_ms_utc: 1_546_300_800_000 + i * 1_800_000,
            tail_number: format!("N{}", i % 4),
            carrier: "AA".to_string(),
            origin: if i % 2 == 0 { "JFK" } else { "BOS" }.to_string(),
            signals: vec![(i % 3) as f64],
            outcome_minutes: if i % 3 == 2 { 60.0 } else { 0.0 },
        })
        .collect()
}

#[test]
fn run_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_run_start(&cfg, Path::new("flights.csv"), Path::new("data/output"));
        log_config_source("file", Some(Path::new("pipeline.json")));
        log_config_source("default", None);
        log_run_finish(5, 1_234, &[Path::new("data/output/precision_recall.csv")]);
    });

    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"event\":\"config.selected\""));
    assert!(logs.contains("\"source\":\"default\""));
    assert!(logs.contains("\"event\":\"run.finish\""));
    assert!(logs.contains("precision_recall.csv"));
}

#[test]
fn loader_warns_about_dropped_rows() {
    let dataset = DatasetSchema {
        signal_fields: vec!["snow".to_string()],
        ..DatasetSchema::default()
    };
    let csv = "sched_depart_date_time_UTC,TAIL_NUM,OP_UNIQUE_CARRIER,ORIGIN,DEP_DELAY,snow\n\
               2019-01-01 02:00:00,N1,AA,JFK,12,0.5\n\
               2019-01-01 03:00:00,N1,AA,JFK,,0.5\n";

    let logs = capture_logs(Level::INFO, || {
        let (events, report) = read_events(csv.as_bytes(), &dataset).expect("csv reads");
        assert_eq!(events.len(), 1);
        assert_eq!(report.dropped_rows, 1);
    });

    assert!(logs.contains("\"event\":\"records.load.rows_dropped\""));
    assert!(logs.contains("\"event\":\"records.load.finish\""));
}

#[test]
fn stage_functions_emit_structured_events() {
    let events = sample_events(12);
    let dataset = DatasetSchema {
        signal_fields: vec!["snow".to_string()],
        ..DatasetSchema::default()
    };

    let logs = capture_logs(Level::INFO, || {
        let table = aggregate_all(&events, &default_window_configs()).expect("aggregates build");
        build_features(&events, &dataset, &table, &FeatureConfig::default())
            .expect("features build");
        let predictions = vec![Prediction {
            event_time_ms_utc: 0,
            probability_positive: 0.4,
            label: 1,
        }];
        evaluate(&predictions, &Cutoffs::default()).expect("sweep runs");
    });

    assert!(logs.contains("\"event\":\"rolling.aggregate.start\""));
    assert!(logs.contains("\"event\":\"rolling.aggregate.finish\""));
    assert!(logs.contains("\"event\":\"features.schema.built\""));
    assert!(logs.contains("\"event\":\"features.build.finish\""));
    assert!(logs.contains("\"event\":\"evaluate.sweep.finish\""));
}

#[test]
fn pipeline_emits_block_and_run_events() {
    let events = sample_events(60);
    let cfg = PipelineConfig {
        dataset: DatasetSchema {
            signal_fields: vec!["snow".to_string()],
            ..DatasetSchema::default()
        },
        threads: 2,
        ..PipelineConfig::default()
    };

    let logs = capture_logs(Level::INFO, || {
        run_pipeline(&events, &cfg, &LogisticRegression::default()).expect("pipeline runs");
    });

    assert!(logs.contains("\"event\":\"pipeline.run.start\""));
    assert!(logs.contains("\"event\":\"split.block.built\""));
    assert!(logs.contains("\"event\":\"pipeline.block.finish\""));
    assert!(logs.contains("\"event\":\"pipeline.run.finish\""));
}

#[test]
fn constant_column_warns_once() {
    let mut events = sample_events(6);
    for event in &mut events {
        event.signals = vec![1.0];
    }
    let dataset = DatasetSchema {
        signal_fields: vec!["snow".to_string()],
        ..DatasetSchema::default()
    };

    let logs = capture_logs(Level::WARN, || {
        let table = aggregate_all(&events, &[]).expect("no windows is allowed");
        build_features(&events, &dataset, &table, &FeatureConfig::default())
            .expect("features build");
    });

    assert_eq!(
        logs.matches("\"event\":\"features.scaling.zero_variance\"")
            .count(),
        1
    );
}
