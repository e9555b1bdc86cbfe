//! Error taxonomy for a demultiplexing run.
//!
//! Every variant is fatal for the current run: nothing is retried, and the
//! caller is expected to abort and surface the message to the user. Each
//! message names the offending file (and line or record where one exists).

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DemuxError>;

/// Errors raised while loading inputs, demultiplexing or running pipeline steps.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// Missing, empty or ambiguous barcode table, or an invalid run configuration.
    #[error("configuration error in '{path}': {reason}")]
    Config {
        /// File the problem was found in.
        path: PathBuf,
        /// Explanation of the problem.
        reason: String,
    },

    /// An input could not be opened or read, or the output directory could not be created.
    #[error("cannot access '{path}': {source}")]
    InputIo {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// A structurally invalid FASTQ record.
    #[error("malformed FASTQ record in '{path}' at line {line}: {reason}")]
    MalformedRecord {
        /// FASTQ file containing the record.
        path: PathBuf,
        /// 1-based line number of the offending line.
        line: u64,
        /// What was wrong with the record.
        reason: String,
    },

    /// R1 and R2 no longer describe the same fragments.
    #[error("'{r1}' and '{r2}' are out of sync at record {record}: {reason}")]
    DesynchronizedPair {
        /// R1 input.
        r1: PathBuf,
        /// R2 input.
        r2: PathBuf,
        /// 1-based ordinal of the record pair.
        record: u64,
        /// Count or identifier mismatch detail.
        reason: String,
    },

    /// Writing, flushing or publishing an output file failed.
    #[error("cannot write '{path}': {source}")]
    OutputIo {
        /// Output file.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// An external pipeline collaborator is missing or failed.
    #[error("external tool '{tool}' failed: {reason}")]
    ExternalTool {
        /// Program name.
        tool: String,
        /// What went wrong.
        reason: String,
    },

    /// The run was cancelled by the user (Ctrl-C / SIGTERM).
    #[error("interrupted after {pairs} read pairs")]
    Interrupted {
        /// Pairs routed before the run stopped.
        pairs: u64,
    },
}

impl DemuxError {
    pub(crate) fn config(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        DemuxError::Config { path: path.as_ref().to_path_buf(), reason: reason.into() }
    }

    pub(crate) fn input_io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        DemuxError::InputIo { path: path.as_ref().to_path_buf(), source }
    }

    pub(crate) fn output_io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        DemuxError::OutputIo { path: path.as_ref().to_path_buf(), source }
    }

    pub(crate) fn malformed(path: impl AsRef<Path>, line: u64, reason: impl Into<String>) -> Self {
        DemuxError::MalformedRecord { path: path.as_ref().to_path_buf(), line, reason: reason.into() }
    }

    pub(crate) fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        DemuxError::ExternalTool { tool: tool.into(), reason: reason.into() }
    }
}
