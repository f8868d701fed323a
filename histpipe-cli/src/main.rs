//! HistPipe CLI — stock-history ELT pipeline.
//!
//! Commands:
//! - `run` — execute the full pipeline from a TOML config and print the
//!   audit report
//! - `init` — write a commented config template to get started
//!
//! A low match rate is a data-quality warning, not a failure: the
//! process exits zero whenever the pipeline ran to completion, and
//! non-zero only on structural errors (config, database, SQL).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use histpipe_core::{db, pipeline, PipelineConfig, PipelineReport};

#[derive(Parser)]
#[command(
    name = "histpipe",
    about = "HistPipe — merge stock CSV exports into one analytical table"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline: stage both sources, merge, audit.
    Run {
        /// Path to the TOML config file.
        #[arg(long, default_value = "histpipe.toml")]
        config: PathBuf,

        /// Override the configured database path.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Print the full run report as JSON instead of the summary.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Write a commented config template.
    Init {
        /// Where to write the template.
        #[arg(default_value = "histpipe.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, db, json } => run_pipeline(&config, db, json),
        Commands::Init { path, force } => write_template(&path, force),
    }
}

fn run_pipeline(config_path: &Path, db_override: Option<PathBuf>, json: bool) -> Result<()> {
    let mut config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("loading config '{}'", config_path.display()))?;
    if let Some(path) = db_override {
        config.database.path = path;
    }

    let mut conn = db::open(&config.database)?;
    let report = pipeline::run(&mut conn, &config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!();
    println!("=== Audit Report ===");
    println!("Technical rows:   {}", report.audit.technical_rows);
    println!("Fundamental rows: {}", report.audit.fundamental_rows);
    println!("Merged rows:      {}", report.audit.final_rows);
    match report.audit.match_rate {
        Some(rate) => println!("Match rate:       {:.1}%", rate * 100.0),
        None => println!("Match rate:       n/a (empty source)"),
    }
    println!(
        "NULL {}:          {}",
        report.audit.completeness_field, report.audit.null_count
    );
    if report.merge.duplicates_ignored > 0 {
        println!("Duplicates:       {}", report.merge.duplicates_ignored);
    }
    if report.merge.invalid_dates > 0 {
        println!("Invalid dates:    {}", report.merge.invalid_dates);
    }
    if report.merge.malformed_values > 0 {
        println!("Malformed values: {}", report.merge.malformed_values);
    }
    println!(
        "Merge time:       {:.2}s",
        report.merge.duration.as_secs_f64()
    );
    println!(
        "Total time:       {:.2}s",
        report.duration.as_secs_f64()
    );
    println!();
    if report.audit.passed() {
        println!("PASS: sources reconciled");
    } else {
        for warning in &report.audit.warnings {
            println!("WARNING: {warning}");
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"# HistPipe pipeline configuration.
#
# Each source maps CSV columns into the staging schema either by
# zero-based position (`index = 2`) or by header name (`name = "close"`).
# The merged stock_history table gets one REAL column per staged field.

[database]
path = "stock_data.db"
# SQLite page-cache ceiling, in MiB.
memory_limit_mib = 256

[technical]
pattern = "data/technical/*.csv"
# Rows with fewer parsed fields are skipped.
min_columns = 19
symbol = { index = 0 }
date = { index = 1 }

[[technical.fields]]
column = "close"
index = 2

[[technical.fields]]
column = "close_adj"
index = 14

[[technical.fields]]
column = "open_adj"
index = 12

[[technical.fields]]
column = "high_adj"
index = 16

[[technical.fields]]
column = "low_adj"
index = 18

[fundamental]
pattern = "data/fundamental/*.csv"
min_columns = 15
symbol = { index = 0 }
date = { index = 1 }

[[fundamental.fields]]
column = "pe"
index = 14

[audit]
# Warn when merged rows / min(staging rows) falls below this.
match_rate_threshold = 0.90
# Nullable column whose NULL count is reported as a completeness signal.
completeness_field = "pe"
"#;

fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "'{}' already exists — pass --force to overwrite",
            path.display()
        );
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("writing '{}'", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
