//! Typed run configuration shared by every pipeline step.
//!
//! A run is described once by a [`RunConfig`] and persisted as
//! `<run_dir>/run_config.json`; later steps read that file back instead of
//! re-deriving state. The directory layout under `run_dir` is fixed:
//!
//! ```text
//! run_dir/
//!   run_config.json
//!   demultiplexed/    <sample>_<label>_R1.fastq, <sample>_<label>_R2.fastq
//!   trimmed/          trimmer outputs
//!   aligned/          <sample>_<label>.sam / .bam
//!   variants/         <label>.bcf, <label>.vcf
//!   logs/             one log per external tool invocation
//!   summary_files/    per-step summary tables
//! ```
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::barcodes::MatchPolicy;
use crate::demux::{DemuxOptions, TrimPolicy};
use crate::error::{DemuxError, Result};
use crate::summary::write_atomically;

/// Program names (or paths) for the external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub trimmomatic: String,
    pub bwa: String,
    pub samtools: String,
    pub bcftools: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            trimmomatic: "trimmomatic".into(),
            bwa: "bwa".into(),
            samtools: "samtools".into(),
            bcftools: "bcftools".into(),
        }
    }
}

fn default_threads() -> usize { num_cpus::get() }

/// Everything needed to run the pipeline for one population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Sample/population label used in every output name.
    pub label: String,
    pub run_dir: PathBuf,
    pub barcodes: PathBuf,
    /// Restriction-site overhang following each barcode.
    pub overhang: String,
    pub r1: PathBuf,
    pub r2: PathBuf,
    /// Reference FASTA for alignment and calling; required by those steps only.
    #[serde(default)]
    pub reference: Option<PathBuf>,
    #[serde(default)]
    pub match_policy: MatchPolicy,
    #[serde(default)]
    pub trim_policy: TrimPolicy,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub tools: ToolPaths,
}

impl RunConfig {
    pub const FILE_NAME: &'static str = "run_config.json";

    /// Read and validate a persisted configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let bytes = fs::read(p).map_err(|e| DemuxError::input_io(p, e))?;
        let cfg: RunConfig =
            serde_json::from_slice(&bytes).map_err(|e| DemuxError::config(p, format!("invalid run configuration: {e}")))?;
        cfg.validate_at(p)?;
        Ok(cfg)
    }

    /// Persist to `<run_dir>/run_config.json`, returning the path written.
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.config_path();
        self.validate_at(&path)?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| DemuxError::config(&path, format!("cannot serialize run configuration: {e}")))?;
        write_atomically(&path, &json)?;
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> { self.validate_at(&self.config_path()) }

    fn validate_at(&self, at: &Path) -> Result<()> {
        if self.label.is_empty() || self.label.contains(['/', '\\']) || self.label.chars().any(char::is_whitespace) {
            return Err(DemuxError::config(at, format!("label '{}' must be a non-empty name without separators or spaces", self.label)));
        }
        if self.threads == 0 {
            return Err(DemuxError::config(at, "threads must be at least 1"));
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf { self.run_dir.join(Self::FILE_NAME) }

    pub fn demux_dir(&self) -> PathBuf { self.run_dir.join("demultiplexed") }

    pub fn trimmed_dir(&self) -> PathBuf { self.run_dir.join("trimmed") }

    pub fn aligned_dir(&self) -> PathBuf { self.run_dir.join("aligned") }

    pub fn variants_dir(&self) -> PathBuf { self.run_dir.join("variants") }

    pub fn logs_dir(&self) -> PathBuf { self.run_dir.join("logs") }

    pub fn summary_dir(&self) -> PathBuf { self.run_dir.join("summary_files") }

    /// The reference, or a configuration error naming the step that needs it.
    pub fn require_reference(&self, step: &str) -> Result<&Path> {
        self.reference
            .as_deref()
            .ok_or_else(|| DemuxError::config(self.config_path(), format!("the {step} step needs a reference FASTA")))
    }

    pub fn demux_options(&self) -> DemuxOptions {
        let mut opts = DemuxOptions::new(self.label.clone(), self.demux_dir(), self.summary_dir());
        opts.match_policy = self.match_policy;
        opts.trim_policy = self.trim_policy;
        opts.threads = self.threads;
        opts
    }
}
