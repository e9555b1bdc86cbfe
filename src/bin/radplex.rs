use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use radplex::demux::{self, DemuxOptions, TrimPolicy};
use radplex::pipeline;
use radplex::summary::summary_frame;
use radplex::{DemuxReport, MatchPolicy, RunConfig, ToolPaths};

/// radplex CLI
#[derive(Parser)]
#[command(name = "radplex")]
#[command(version)]
#[command(about = "Paired-end RAD/GBS demultiplexer and pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Demultiplex one paired-end library into per-sample FASTQ files
    Demux {
        /// Barcode table (`barcode` or `sample<TAB>barcode` per line)
        #[arg(long)]
        barcodes: PathBuf,
        /// Restriction-site overhang following each barcode (e.g. TGCA)
        #[arg(long)]
        overhang: String,
        /// Forward reads (FASTQ or FASTQ.GZ)
        #[arg(long)]
        r1: PathBuf,
        /// Reverse reads (FASTQ or FASTQ.GZ)
        #[arg(long)]
        r2: PathBuf,
        /// Population label used in output names
        #[arg(long)]
        population: String,
        /// Directory for per-sample FASTQs
        #[arg(long, default_value = "demultiplexed")]
        out: PathBuf,
        /// Directory for the summary table
        #[arg(long, default_value = "summary_files")]
        summary_dir: PathBuf,
        /// Tag matching: `exact` or `mismatches:N`
        #[arg(long, default_value = "exact")]
        matching: MatchPolicy,
        /// Which mates lose the tag: `r1-only` or `both`
        #[arg(long, default_value = "r1-only")]
        trim: TrimPolicy,
        /// Threads (default: all)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Write a run_config.json describing a pipeline run
    Init {
        /// Run directory; created if absent
        #[arg(long)]
        run_dir: PathBuf,
        /// Population label used in output names
        #[arg(long)]
        label: String,
        #[arg(long)]
        barcodes: PathBuf,
        #[arg(long)]
        overhang: String,
        #[arg(long)]
        r1: PathBuf,
        #[arg(long)]
        r2: PathBuf,
        /// Reference FASTA (needed by the align and call steps)
        #[arg(long)]
        reference: Option<PathBuf>,
        #[arg(long, default_value = "exact")]
        matching: MatchPolicy,
        #[arg(long, default_value = "r1-only")]
        trim: TrimPolicy,
        /// Threads (default: all)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Run pipeline steps from a run_config.json
    Run {
        /// Path to run_config.json
        #[arg(long)]
        config: PathBuf,
        /// Comma-separated steps (demultiplex,trim,align,call)
        #[arg(long, default_value = "demultiplex,trim,align,call")]
        steps: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cancel = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_interrupt_handler(Arc::clone(&cancel)) {
        warn!("cannot install Ctrl-C handler: {e}");
    }
    if let Err(e) = run(Cli::parse(), cancel) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// First Ctrl-C asks the running pass to stop at the next chunk; a second one exits at once.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if cancel.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!("interrupt received, finishing the current chunk (press Ctrl-C again to exit now)");
    })?;
    Ok(())
}

fn run(cli: Cli, cancel: Arc<AtomicBool>) -> Result<()> {
    match cli.command {
        Commands::Demux { barcodes, overhang, r1, r2, population, out, summary_dir, matching, trim, threads } => {
            let mut opts = DemuxOptions::new(population, out, summary_dir);
            opts.cancel = cancel;
            opts.match_policy = matching;
            opts.trim_policy = trim;
            if let Some(t) = threads.filter(|t| *t > 0) {
                opts.threads = t;
            }
            let report = demux::demultiplex_files(&barcodes, &overhang, &r1, &r2, &opts)
                .with_context(|| format!("demultiplexing {} / {}", r1.display(), r2.display()))?;
            print_report(&report, &opts)?;
        }

        Commands::Init { run_dir, label, barcodes, overhang, r1, r2, reference, matching, trim, threads } => {
            let cfg = RunConfig {
                label,
                run_dir,
                barcodes,
                overhang,
                r1,
                r2,
                reference,
                match_policy: matching,
                trim_policy: trim,
                threads: threads.filter(|t| *t > 0).unwrap_or_else(num_cpus::get),
                tools: ToolPaths::default(),
            };
            let path = cfg.save().context("writing run configuration")?;
            println!("run configuration: {}", path.display());
        }

        Commands::Run { config, steps } => {
            let cfg = RunConfig::load(&config).with_context(|| format!("loading {}", config.display()))?;
            let steps = pipeline::parse_steps(&steps)?;
            info!("running {} for '{}'", steps.iter().map(|s| s.name()).collect::<Vec<_>>().join(", "), cfg.label);
            pipeline::run_pipeline_with_cancel(&cfg, &steps, cancel)?;
            println!("run directory: {}", cfg.run_dir.display());
            println!("summaries: {}", cfg.summary_dir().display());
        }
    }
    Ok(())
}

fn print_report(report: &DemuxReport, opts: &DemuxOptions) -> Result<()> {
    let df = summary_frame(&report.stats).context("building summary table")?;

    // Show every sample row in full.
    std::env::set_var("POLARS_FMT_TABLE_FORMATTING", "UTF8_FULL");
    std::env::set_var("POLARS_FMT_MAX_COLS", "100000");
    std::env::set_var("POLARS_FMT_MAX_ROWS", "1000000");
    std::env::set_var("POLARS_FMT_STR_LEN", "100000");
    std::env::set_var("POLARS_TABLE_WIDTH", "65535");
    println!("{df}");

    println!(
        "total pairs: {}  unmatched: {}",
        report.stats.total_raw_pairs, report.stats.unmatched_pairs
    );
    println!("per-sample FASTQs: {}", opts.output_dir.display());
    println!("summary: {}", report.summary_path.display());
    Ok(())
}
