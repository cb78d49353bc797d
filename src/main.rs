// Main module for transaction anomaly scoring. Loads a batch, scores it with
// every enabled detector, prints a summary and exports the results.
use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use tracing::info;

use config::{ConfigOverrides, PipelineConfig};
use csv_reader::{CsvSource, TransactionSource};
use error::{Stage, StageExt};
use features::FeatureEngine;
use pipeline::FraudSession;
use report::{DetectorReport, EnsembleReport};

mod config;
mod csv_reader;
mod detectors;
mod encoder;
mod error;
mod export;
mod features;
mod pipeline;
mod report;
mod scaler;
mod search;

/// Offline anomaly scoring for card transactions.
#[derive(Parser, Debug)]
#[command(name = "fraud_scoring", version, about)]
struct Cli {
    /// Transactions to fit the session on.
    #[arg(long, env = "FRAUD_INPUT")]
    input: PathBuf,

    /// Optional second batch scored with the state fitted on --input.
    #[arg(long)]
    predict: Option<PathBuf>,

    /// TOML pipeline configuration.
    #[arg(long, env = "FRAUD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "FRAUD_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// File name prefix for exported results.
    #[arg(long, default_value = "fraud")]
    prefix: String,

    /// Date expiry features are measured from (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    reference_date: Option<NaiveDate>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

// Displays the flagged-row characteristics of one detector
// Inputs: detector report and total record count
// Outputs: Prints formatted summary to console
// Key steps:
// 1. Show flagged count and rate
// 2. List distinct and most common locations and email domains
// 3. Compare normal and flagged feature averages
fn print_detector(detector: &DetectorReport, total: usize) {
    let summary = &detector.summary;
    println!("\n{}", summary.detector.name());
    println!("Flagged: {} of {} ({:.2}%)", summary.flagged, total, summary.rate * 100.0);
    if summary.flagged == 0 {
        return;
    }

    println!(
        "Unique countries: {}, states: {}, email domains: {}",
        summary.unique_countries, summary.unique_states, summary.unique_domains
    );
    let top = |values: &[report::ValueCount]| {
        values
            .iter()
            .map(|v| format!("{} ({})", v.value, v.count))
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("Top countries: {}", top(&summary.top_countries));
    println!("Top states: {}", top(&summary.top_states));
    println!("Top email domains: {}", top(&summary.top_domains));

    // Normal vs flagged feature averages
    println!("\nFeature Analysis (normal vs flagged):");
    for p in &detector.profile {
        if let (Some(normal), Some(flagged)) = (p.normal.mean, p.flagged.mean) {
            println!("{:<28} {:>10.2} {:>10.2}", p.feature, normal, flagged);
        }
    }
}

// Displays the ensemble report
// Inputs: report built from the scored batch
// Outputs: Prints formatted analysis to console
// Key steps:
// 1. Print each detector's summary
// 2. Show pairwise overlap between detectors
// 3. Count rows matching the suspicious pattern rules
fn print_report(report: &EnsembleReport) {
    println!("Anomaly Detection Results:");
    println!("Total Transactions: {}", report.total_records);
    for detector in &report.detectors {
        print_detector(detector, report.total_records);
    }

    if !report.overlaps.is_empty() {
        println!("\nOverlap Between Detectors:");
        for o in &report.overlaps {
            println!(
                "{} & {}: {} rows (of {} / {})",
                o.first.name(),
                o.second.name(),
                o.both,
                o.first_flagged,
                o.second_flagged
            );
        }
    }

    println!("\nSuspicious Patterns:");
    let patterns = [
        ("Customers with more than 3 cards", report.patterns.multiple_cards_per_customer),
        ("Cards with more than 2 zip codes", report.patterns.multiple_addresses_per_card),
        ("Cards used more than 10 times", report.patterns.high_frequency_cards),
        ("Cards shared by several users", report.patterns.multiple_users_per_card),
    ];
    for (label, count) in patterns {
        match count {
            Some(count) => println!("{label}: {count} rows"),
            None => println!("{label}: n/a"),
        }
    }
}

// Runs one scoring session end to end
// Inputs: parsed command line
// Outputs: Result indicating success or the failing stage
// Key steps:
// 1. Load configuration and apply command line overrides
// 2. Fit the session on --input, then score --predict if given
// 3. Build and print the report
// 4. Export results once everything above succeeded
fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate()?;

    let engine = cli
        .reference_date
        .map(FeatureEngine::new)
        .unwrap_or_else(FeatureEngine::today);
    info!(reference = %engine.reference(), detectors = ?config.detectors, "starting run");

    let batch = CsvSource::new(&cli.input)
        .load()
        .stage(Stage::Load)
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let mut session = FraudSession::new(&config, engine)?;
    let mut scored = session.fit(&batch)?;

    // Score the second batch with fit-time state when one is given
    let batch = match &cli.predict {
        Some(path) => {
            let later = CsvSource::new(path)
                .load()
                .stage(Stage::Load)
                .with_context(|| format!("reading {}", path.display()))?;
            scored = session.predict(&later)?;
            later
        }
        None => batch,
    };

    let report = EnsembleReport::build(&batch, &scored).stage(Stage::Report)?;
    print_report(&report);

    let written = export::write_results(&cli.output_dir, &cli.prefix, &batch, &scored, &report)
        .stage(Stage::Export)?;
    println!();
    for path in written {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

// Main entry point for transaction anomaly scoring
// Inputs: None
// Outputs: Result indicating success or error
// Key steps:
// 1. Install the tracing subscriber (RUST_LOG, default info)
// 2. Parse arguments and run
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run(Cli::parse())
}
