use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use delaycast::{
    load_events_csv, run_pipeline, write_artifacts, Classifier, FeatureRow, LogisticModel,
    LogisticRegression, PipelineConfig, PipelineError, SplitConfig, SplitError, TrainError,
    COEFFICIENTS_FILE, PRECISION_RECALL_FILE,
};
use tempfile::{tempdir, NamedTempFile};

const HEADER: &str = "sched_depart_date_time_UTC,TAIL_NUM,OP_UNIQUE_CARRIER,ORIGIN,DEP_DELAY,origin_DailySnowfall,origin_6Hr_Precipitation,origin_12Hr_Precipitation";
const CARRIERS: [&str; 3] = ["AA", "DL", "UA"];
const ORIGINS: [&str; 4] = ["JFK", "LAX", "ORD", "ATL"];

/// 240 flights, 15 minutes apart, where snowy departures run late.
fn seed_csv(extra_rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp csv should be created");
    writeln!(file, "{HEADER}").expect("header written");
    for i in 0..240u32 {
        let minutes = i * 15;
        let day = 1 + minutes / 1_440;
        let hour = (minutes % 1_440) / 60;
        let minute = minutes % 60;
        let snowfall = f64::from((i * 7) % 10) / 2.0;
        let delay = if snowfall > 2.5 {
            40 + i % 20
        } else {
            i % 10
        };
        writeln!(
            file,
            "2019-01-{day:02} {hour:02}:{minute:02}:00,N{},{},{},{delay},{snowfall},{},{}",
            i % 12,
            CARRIERS[(i % 3) as usize],
            ORIGINS[(i % 4) as usize],
            f64::from(i % 5) / 10.0,
            f64::from(i % 7) / 10.0,
        )
        .expect("row written");
    }
    for row in extra_rows {
        writeln!(file, "{row}").expect("extra row written");
    }
    file.flush().expect("csv flushed");
    file
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        threads: 2,
        ..PipelineConfig::default()
    }
}

#[test]
fn csv_to_artifacts_end_to_end() {
    let csv = seed_csv(&[
        "not-a-time,N1,AA,JFK,5,0,0,0",
        "2019-01-02 03:00:00,N1,AA,JFK,,0,0,0",
    ]);
    let cfg = test_config();

    let (events, report) = load_events_csv(csv.path(), &cfg.dataset).expect("csv loads");
    assert_eq!(report.input_rows, 242);
    assert_eq!(report.loaded_rows, 240);
    assert_eq!(report.dropped_rows, 2);

    let output = run_pipeline(&events, &cfg, &LogisticRegression::default())
        .expect("pipeline should succeed");

    assert_eq!(output.blocks.len(), 5);
    assert_eq!(output.schema.columns.len(), 7);
    assert_eq!(
        output.schema.names(),
        vec![
            "origin_DailySnowfall",
            "origin_6Hr_Precipitation",
            "origin_12Hr_Precipitation",
            "av_airport_delay",
            "prev_delay",
            "av_carrier_delay",
            "num_flights",
        ]
    );

    let tested: usize = output.blocks.iter().map(|block| block.test_rows).sum();
    assert_eq!(output.evaluated_records, tested as u64);
    for block in &output.blocks {
        assert!(block.train_rows > 0);
        assert!(block.test_rows > 0);
        assert_eq!(block.coefficients.len(), 7);
    }

    assert_eq!(output.metrics.len(), 8);
    assert_eq!(output.metrics[0].recall, Some(1.0));
    for pair in output.metrics.windows(2) {
        assert!(pair[1].true_positives <= pair[0].true_positives);
        assert!(pair[1].false_positives <= pair[0].false_positives);
    }

    let snow = output
        .significant_coefficients
        .get("origin_DailySnowfall")
        .copied()
        .expect("snowfall should be a significant predictor");
    assert!(snow > 0.0, "snowfall coefficient should be positive: {snow}");
    for name in output.significant_coefficients.keys() {
        assert!(output.schema.names().contains(&name.as_str()));
    }

    let out_dir = tempdir().expect("temp output dir");
    let paths = write_artifacts(&out_dir.path().join("run"), &output).expect("artifacts written");
    assert_eq!(paths.precision_recall.file_name().and_then(|n| n.to_str()), Some(PRECISION_RECALL_FILE));
    assert_eq!(paths.coefficients.file_name().and_then(|n| n.to_str()), Some(COEFFICIENTS_FILE));

    let pr = fs::read_to_string(&paths.precision_recall).expect("precision/recall readable");
    let mut lines = pr.lines();
    assert_eq!(lines.next(), Some("Cutoff,TP,FP,Precision,Recall"));
    assert_eq!(lines.count(), 8);

    let raw = fs::read_to_string(&paths.coefficients).expect("coefficients readable");
    let parsed: BTreeMap<String, f64> =
        serde_json::from_str(&raw).expect("coefficients are a JSON object");
    assert_eq!(parsed, output.significant_coefficients);
}

#[test]
fn repeated_runs_are_identical() {
    let csv = seed_csv(&[]);
    let cfg = test_config();
    let (events, _) = load_events_csv(csv.path(), &cfg.dataset).expect("csv loads");

    let a = run_pipeline(&events, &cfg, &LogisticRegression::default()).expect("first run");
    let single_thread = PipelineConfig {
        threads: 1,
        ..test_config()
    };
    let b = run_pipeline(&events, &single_thread, &LogisticRegression::default())
        .expect("second run");

    assert_eq!(a, b);
}

#[test]
fn partial_json_config_fills_defaults() {
    let mut file = NamedTempFile::new().expect("temp config should be created");
    write!(
        file,
        r#"{{"split": {{"num_blocks": 3}}, "cutoffs": [0.0, 0.5], "threads": 2}}"#
    )
    .expect("config written");
    file.flush().expect("config flushed");

    let cfg = PipelineConfig::from_json_file(file.path()).expect("config parses");

    assert_eq!(cfg.split.num_blocks, 3);
    assert_eq!(cfg.split.split_ratio, SplitConfig::default().split_ratio);
    assert_eq!(cfg.cutoffs.as_slice(), &[0.0, 0.5]);
    assert_eq!(cfg.windows, PipelineConfig::default().windows);
    cfg.validate().expect("partial config validates");
}

#[test]
fn unsorted_cutoffs_in_json_are_rejected() {
    let mut file = NamedTempFile::new().expect("temp config should be created");
    write!(file, r#"{{"cutoffs": [0.5, 0.1]}}"#).expect("config written");
    file.flush().expect("config flushed");

    let err = PipelineConfig::from_json_file(file.path()).expect_err("unsorted cutoffs fail");
    assert!(matches!(err, PipelineError::Json(_)));
}

#[test]
fn invalid_split_fails_before_training() {
    let csv = seed_csv(&[]);
    let cfg = PipelineConfig {
        split: SplitConfig {
            num_blocks: 0,
            split_ratio: 0.8,
        },
        ..test_config()
    };
    let (events, _) = load_events_csv(csv.path(), &cfg.dataset).expect("csv loads");

    let err = run_pipeline(&events, &cfg, &LogisticRegression::default())
        .expect_err("zero blocks must fail");
    assert!(matches!(
        err,
        PipelineError::Split(SplitError::InvalidBlockCount(0))
    ));
}

#[test]
fn empty_dataset_is_rejected() {
    let err = run_pipeline(&[], &test_config(), &LogisticRegression::default())
        .expect_err("no events must fail");
    assert!(matches!(err, PipelineError::EmptyDataset));
}

struct RefusingClassifier;

impl Classifier for RefusingClassifier {
    type Model = LogisticModel;

    fn fit(&self, _rows: &[&FeatureRow]) -> Result<LogisticModel, TrainError> {
        Err(TrainError::EmptyTrainingSet)
    }
}

#[test]
fn training_failure_names_the_block() {
    let csv = seed_csv(&[]);
    let cfg = test_config();
    let (events, _) = load_events_csv(csv.path(), &cfg.dataset).expect("csv loads");

    let err = run_pipeline(&events, &cfg, &RefusingClassifier).expect_err("training must fail");

    assert!(matches!(
        err,
        PipelineError::Training {
            source: TrainError::EmptyTrainingSet,
            ..
        }
    ));
}
