use std::env;
use std::path::PathBuf;

use delaycast::{
    init_logging, load_events_csv, log_config_source, log_run_finish, log_run_start,
    logging_config_from_env, run_pipeline, write_artifacts, LogisticRegression, PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let input = env::var("DELAYCAST_INPUT")
        .map(PathBuf::from)
        .map_err(|_| "DELAYCAST_INPUT must point at the flight events CSV")?;
    let output_dir = env::var("DELAYCAST_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/output"));
    log_run_start(&logging_cfg, &input, &output_dir);

    let cfg = match env::var("DELAYCAST_CONFIG") {
        Ok(raw) => {
            let path = PathBuf::from(raw);
            log_config_source("file", Some(&path));
            PipelineConfig::from_json_file(&path)?
        }
        Err(_) => {
            log_config_source("default", None);
            PipelineConfig::default()
        }
    };
    cfg.validate()?;

    let (events, report) = load_events_csv(&input, &cfg.dataset)?;
    println!(
        "Loaded {} of {} rows from {} (dropped={})",
        report.loaded_rows,
        report.input_rows,
        input.display(),
        report.dropped_rows
    );
    if let Some(first_error) = &report.first_error {
        println!("  first dropped row: {first_error}");
    }

    let classifier = LogisticRegression::new(cfg.classifier.clone());
    let output = run_pipeline(&events, &cfg, &classifier)?;

    for block in &output.blocks {
        println!(
            "block {} | train=({:.6}, {:.6}] rows={} | test=({:.6}, {:.6}] rows={} positives={}",
            block.boundaries.index,
            block.boundaries.train.lower,
            block.boundaries.train.upper,
            block.train_rows,
            block.boundaries.test.lower,
            block.boundaries.test.upper,
            block.test_rows,
            block.test_positives
        );
    }

    println!("\nCutoff      TP        FP        Precision  Recall");
    for metric in &output.metrics {
        println!(
            "{:<11.2} {:<9} {:<9} {:<10} {}",
            metric.cutoff,
            metric.true_positives,
            metric.false_positives,
            format_ratio(metric.precision),
            format_ratio(metric.recall)
        );
    }

    println!("\nSignificant coefficients (block 0):");
    for (name, weight) in &output.significant_coefficients {
        println!("  {name}: {weight:.6}");
    }

    let paths = write_artifacts(&output_dir, &output)?;
    log_run_finish(
        output.blocks.len(),
        output.evaluated_records,
        &[paths.precision_recall.as_path(), paths.coefficients.as_path()],
    );
    println!(
        "\nWrote {} and {}",
        paths.precision_recall.display(),
        paths.coefficients.display()
    );

    Ok(())
}

fn format_ratio(value: Option<f64>) -> String {
    match value {
        Some(ratio) => format!("{ratio:.4}"),
        None => "undefined".to_string(),
    }
}
