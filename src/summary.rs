//! Demultiplexing statistics and the per-sample summary report.
//!
//! The summary is a tab-separated table with a fixed header:
//!
//! ```text
//! sample_name  read1_count  pct_of_raw_read1  read2_count  pct_of_raw_read2
//! ```
//!
//! Percentages are `100 * count / total_raw_pairs`, rounded half away from zero
//! to two decimal places (`0.00` when there were no raw pairs). Files are built
//! fully in memory, written once to a sibling temporary file and renamed into
//! place, so a crash never leaves a half-written summary behind.
use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::{df, DataFrame, PolarsResult};
use serde::{Deserialize, Serialize};

use crate::error::{DemuxError, Result};

/// Column names of the summary table, in order.
pub const SUMMARY_HEADER: [&str; 5] = ["sample_name", "read1_count", "pct_of_raw_read1", "read2_count", "pct_of_raw_read2"];

/// Reads routed to one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub sample_name: String,
    pub read1_count: u64,
    pub read2_count: u64,
}

/// Counts for a whole demultiplexing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemuxStats {
    /// One entry per barcode-table sample, in table order.
    pub samples: Vec<SampleCounts>,
    pub total_raw_pairs: u64,
    /// Pairs whose leading window matched no tag (including ambiguous matches).
    pub unmatched_pairs: u64,
}

impl DemuxStats {
    pub fn new<I: IntoIterator<Item = String>>(sample_names: I) -> Self {
        DemuxStats {
            samples: sample_names
                .into_iter()
                .map(|sample_name| SampleCounts { sample_name, read1_count: 0, read2_count: 0 })
                .collect(),
            total_raw_pairs: 0,
            unmatched_pairs: 0,
        }
    }

    pub(crate) fn record_match(&mut self, sample: usize) {
        self.total_raw_pairs += 1;
        let c = &mut self.samples[sample];
        c.read1_count += 1;
        c.read2_count += 1;
    }

    pub(crate) fn record_unmatched(&mut self) {
        self.total_raw_pairs += 1;
        self.unmatched_pairs += 1;
    }

    pub fn matched_read1(&self) -> u64 { self.samples.iter().map(|s| s.read1_count).sum() }

    pub fn matched_read2(&self) -> u64 { self.samples.iter().map(|s| s.read2_count).sum() }

    /// `true` when every raw pair is accounted for, on both mates.
    pub fn is_conserved(&self) -> bool {
        self.matched_read1() + self.unmatched_pairs == self.total_raw_pairs
            && self.matched_read2() + self.unmatched_pairs == self.total_raw_pairs
    }

    pub fn unmatched_fraction(&self) -> f64 {
        if self.total_raw_pairs == 0 { 0.0 } else { self.unmatched_pairs as f64 / self.total_raw_pairs as f64 }
    }
}

/// `100 * count / total`, rounded half away from zero to two decimals.
pub fn percent_of(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (100.0 * count as f64 / total as f64 * 100.0).round() / 100.0
}

fn format_percent(count: u64, total: u64) -> String { format!("{:.2}", percent_of(count, total)) }

/// Render the summary table as TSV text.
pub fn render_summary(stats: &DemuxStats) -> Result<String> {
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_writer(Vec::new());
    let to_err = |e: csv::Error| DemuxError::output_io("<summary>", std::io::Error::other(e));
    w.write_record(SUMMARY_HEADER).map_err(to_err)?;
    for s in &stats.samples {
        w.write_record([
            s.sample_name.clone(),
            s.read1_count.to_string(),
            format_percent(s.read1_count, stats.total_raw_pairs),
            s.read2_count.to_string(),
            format_percent(s.read2_count, stats.total_raw_pairs),
        ])
        .map_err(to_err)?;
    }
    let bytes = w.into_inner().map_err(|e| DemuxError::output_io("<summary>", std::io::Error::other(e.to_string())))?;
    String::from_utf8(bytes).map_err(|e| DemuxError::output_io("<summary>", std::io::Error::other(e)))
}

/// Write `contents` to `path` in one write through a sibling temporary file.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| DemuxError::output_io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(|e| DemuxError::output_io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| DemuxError::output_io(path, e))
}

/// Location of the summary table for a population label.
pub fn summary_path(summary_dir: &Path, label: &str) -> PathBuf {
    summary_dir.join(format!("{label}_demultiplex_summary.tsv"))
}

/// Location of the JSON run statistics for a population label.
pub fn stats_path(summary_dir: &Path, label: &str) -> PathBuf {
    summary_dir.join(format!("{label}_demultiplex_stats.json"))
}

/// Write the TSV summary and the JSON statistics; returns the summary path.
pub fn write_reports(stats: &DemuxStats, summary_dir: &Path, label: &str) -> Result<PathBuf> {
    let summary = summary_path(summary_dir, label);
    write_atomically(&summary, render_summary(stats)?.as_bytes())?;
    let json = serde_json::to_vec_pretty(stats)
        .map_err(|e| DemuxError::output_io(stats_path(summary_dir, label), std::io::Error::other(e)))?;
    write_atomically(&stats_path(summary_dir, label), &json)?;
    Ok(summary)
}

/// The summary as a DataFrame, for console display.
pub fn summary_frame(stats: &DemuxStats) -> PolarsResult<DataFrame> {
    let total = stats.total_raw_pairs;
    df!(
        "sample_name"      => stats.samples.iter().map(|s| s.sample_name.clone()).collect::<Vec<_>>(),
        "read1_count"      => stats.samples.iter().map(|s| s.read1_count).collect::<Vec<_>>(),
        "pct_of_raw_read1" => stats.samples.iter().map(|s| percent_of(s.read1_count, total)).collect::<Vec<_>>(),
        "read2_count"      => stats.samples.iter().map(|s| s.read2_count).collect::<Vec<_>>(),
        "pct_of_raw_read2" => stats.samples.iter().map(|s| percent_of(s.read2_count, total)).collect::<Vec<_>>(),
    )
}
