//! The demultiplexing pass: match, trim and route paired reads to samples.
//!
//! Pairs are pulled from the inputs in fixed-size chunks. Each chunk is classified
//! in parallel on a local Rayon pool (matching and trimming are pure per-pair
//! work), then written out sequentially in input order, so every sample's files
//! keep the relative order their reads had in the input and repeated runs produce
//! byte-identical output.
//!
//! A pair whose R1 begins with a known tag is trimmed and appended to that
//! sample's files; any other pair is counted as unmatched and dropped. The
//! summary table and statistics are written only after the whole pass succeeds.
//!
//! The pass polls [`DemuxOptions::cancel`] after each written chunk. Once it is
//! set the pass stops with [`DemuxError::Interrupted`] and the per-sample files
//! stay flushed under their `.partial` names.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};

use crate::barcodes::{BarcodeTable, MatchPolicy, SampleId, TagMatch};
use crate::error::{DemuxError, Result};
use crate::fastq::{PairedReader, ReadPair};
use crate::summary::{self, DemuxStats};
use crate::writers::{SampleOutput, SampleWriterPool};

/// Pairs classified per parallel batch.
pub const DEFAULT_CHUNK: usize = 2000;

const PROGRESS_EVERY: u64 = 1_000_000;
const HIGH_UNMATCHED: f64 = 0.5;

/// Which mates lose the matched tag length from their 5' end.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrimPolicy {
    /// Only R1 carries the inline barcode and overhang.
    #[default]
    R1Only,
    /// Trim the same number of bases from R2 as well.
    Both,
}

impl FromStr for TrimPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "r1-only" | "r1" => Ok(TrimPolicy::R1Only),
            "both" => Ok(TrimPolicy::Both),
            other => Err(format!("unknown trim policy '{other}' (expected 'r1-only' or 'both')")),
        }
    }
}

impl fmt::Display for TrimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrimPolicy::R1Only => "r1-only",
            TrimPolicy::Both => "both",
        })
    }
}

/// Everything a pass needs besides the barcode table and the inputs.
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Sample/population label, used in output and summary file names.
    pub population: String,
    /// Directory receiving the per-sample FASTQ pairs; created if absent.
    pub output_dir: PathBuf,
    /// Directory receiving the summary table and statistics.
    pub summary_dir: PathBuf,
    pub match_policy: MatchPolicy,
    pub trim_policy: TrimPolicy,
    pub threads: usize,
    pub chunk_size: usize,
    /// Set from another thread (e.g. a signal handler) to stop the pass at the next chunk boundary.
    pub cancel: Arc<AtomicBool>,
}

impl DemuxOptions {
    pub fn new(population: impl Into<String>, output_dir: impl Into<PathBuf>, summary_dir: impl Into<PathBuf>) -> Self {
        DemuxOptions {
            population: population.into(),
            output_dir: output_dir.into(),
            summary_dir: summary_dir.into(),
            match_policy: MatchPolicy::Exact,
            trim_policy: TrimPolicy::R1Only,
            threads: num_cpus::get(),
            chunk_size: DEFAULT_CHUNK,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Result of a successful pass.
#[derive(Debug, Clone)]
pub struct DemuxReport {
    pub stats: DemuxStats,
    pub outputs: Vec<SampleOutput>,
    pub summary_path: PathBuf,
}

/// Where a pair goes after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Sample(SampleId),
    Unmatched,
}

/// Match one pair against the table and trim it if it matched.
pub fn classify(table: &BarcodeTable, policy: MatchPolicy, trim: TrimPolicy, mut pair: ReadPair) -> (Route, ReadPair) {
    let window = &pair.r1.seq[..pair.r1.seq.len().min(table.max_tag_len())];
    match table.find(window, policy) {
        TagMatch::Matched(id) => {
            let n = table.tag(id).len();
            pair.r1.trim_front(n);
            if trim == TrimPolicy::Both {
                pair.r2.trim_front(n);
            }
            (Route::Sample(id), pair)
        }
        TagMatch::Ambiguous | TagMatch::Unmatched => (Route::Unmatched, pair),
    }
}

/// Load the barcode table and demultiplex `r1`/`r2` into per-sample files.
pub fn demultiplex_files<P: AsRef<Path>, Q: AsRef<Path>>(
    barcodes: &Path,
    overhang: &str,
    r1: P,
    r2: Q,
    opts: &DemuxOptions,
) -> Result<DemuxReport> {
    let table = BarcodeTable::from_path(barcodes, overhang)?;
    info!("loaded {} barcodes from {} (overhang {})", table.len(), barcodes.display(), table.overhang());
    demultiplex(&table, r1, r2, opts)
}

/// Demultiplex two FASTQ files with an already loaded table.
pub fn demultiplex<P: AsRef<Path>, Q: AsRef<Path>>(table: &BarcodeTable, r1: P, r2: Q, opts: &DemuxOptions) -> Result<DemuxReport> {
    let reader = PairedReader::open(r1, r2)?;
    demultiplex_reader(table, reader, opts)
}

/// Demultiplex from an already opened paired reader.
///
/// On error, buckets already opened are flushed and left under their `.partial`
/// names, and no summary is written.
pub fn demultiplex_reader(table: &BarcodeTable, mut reader: PairedReader, opts: &DemuxOptions) -> Result<DemuxReport> {
    let mut pool = SampleWriterPool::new(&opts.output_dir, &opts.population, table)?;
    let stats = match route_all(table, &mut reader, &mut pool, opts) {
        Ok(stats) => stats,
        Err(e) => {
            pool.abandon();
            return Err(e);
        }
    };
    pool.open_all()?;
    let outputs = pool.close_all()?;
    debug_assert!(stats.is_conserved());

    for s in stats.samples.iter().filter(|s| s.read1_count == 0) {
        warn!("sample '{}' received no reads", s.sample_name);
    }
    if stats.unmatched_fraction() > HIGH_UNMATCHED {
        warn!(
            "{} of {} pairs ({:.1}%) matched no barcode; check the barcode table and overhang",
            stats.unmatched_pairs,
            stats.total_raw_pairs,
            100.0 * stats.unmatched_fraction()
        );
    }

    let summary_path = summary::write_reports(&stats, &opts.summary_dir, &opts.population)?;
    info!(
        "demultiplexed {} pairs: {} matched, {} unmatched",
        stats.total_raw_pairs,
        stats.matched_read1(),
        stats.unmatched_pairs
    );
    info!("per-sample FASTQs in {}", opts.output_dir.display());
    info!("summary written to {}", summary_path.display());
    Ok(DemuxReport { stats, outputs, summary_path })
}

fn route_all(
    table: &BarcodeTable,
    reader: &mut PairedReader,
    pool: &mut SampleWriterPool,
    opts: &DemuxOptions,
) -> Result<DemuxStats> {
    let threads = opts.threads.max(1);
    let workers = ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| DemuxError::config("<threads>", format!("cannot start {threads} worker threads: {e}")))?;
    let chunk_size = opts.chunk_size.max(1);
    debug!("routing with {threads} threads, {chunk_size} pairs per chunk, {} matching", opts.match_policy);

    let mut stats = DemuxStats::new(table.entries().iter().map(|e| e.sample_name.clone()));
    let mut next_progress = PROGRESS_EVERY;
    let mut chunk: Vec<ReadPair> = Vec::with_capacity(chunk_size);
    loop {
        chunk.clear();
        if reader.next_chunk(chunk_size, &mut chunk)? == 0 {
            break;
        }
        let routed: Vec<(Route, ReadPair)> = workers.install(|| {
            chunk
                .par_drain(..)
                .map(|pair| classify(table, opts.match_policy, opts.trim_policy, pair))
                .collect()
        });
        debug!("routing chunk of {} pairs", routed.len());
        for (route, pair) in &routed {
            match route {
                Route::Sample(id) => {
                    pool.write_pair(*id, pair)?;
                    stats.record_match(id.0);
                }
                Route::Unmatched => stats.record_unmatched(),
            }
        }
        if stats.total_raw_pairs >= next_progress {
            info!("processed {} read pairs ({} unmatched)", stats.total_raw_pairs, stats.unmatched_pairs);
            next_progress += PROGRESS_EVERY;
        }
        if opts.cancel.load(Ordering::Relaxed) {
            warn!("stopping after {} read pairs on user request", stats.total_raw_pairs);
            return Err(DemuxError::Interrupted { pairs: stats.total_raw_pairs });
        }
    }
    Ok(stats)
}
